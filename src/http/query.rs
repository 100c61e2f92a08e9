//! The query-parameter DSL described in spec §4.4, parsed from a raw query
//! string. No dependency on a dedicated URL crate: parameters here are a
//! small closed set of ASCII keys/values, so a hand-rolled splitter plus
//! minimal percent-decoding covers it without pulling in more of the
//! teacher's transitive `url` stack than this endpoint needs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonDialect {
    Minimalistic,
    Js,
    Fs,
}

#[derive(Debug, Clone, Default)]
pub struct StreamQuery {
    pub i: Option<u64>,
    pub tail: Option<u64>,
    pub since: Option<i64>,
    pub recent: Option<i64>,
    pub n: Option<u64>,
    pub period: Option<i64>,
    pub nowait: bool,
    pub stop_after_bytes: Option<u64>,
    pub entries_only: bool,
    pub array: bool,
    pub checked: bool,
    pub json: Option<JsonDialect>,
    pub sizeonly: bool,
    /// `Some(None)` for bare `schema`, `Some(Some(lang))` for `schema=lang`.
    pub schema: Option<Option<String>>,
    pub terminate: Option<String>,
}

impl StreamQuery {
    pub fn parse(raw: &str) -> Self {
        let mut q = StreamQuery::default();
        for pair in raw.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (decode(k), Some(decode(v))),
                None => (decode(pair), None),
            };
            match key.as_str() {
                "i" => q.i = value.and_then(|v| v.parse().ok()),
                "tail" => q.tail = value.and_then(|v| v.parse().ok()),
                "since" => q.since = value.and_then(|v| v.parse().ok()),
                "recent" => q.recent = value.and_then(|v| v.parse().ok()),
                "n" => q.n = value.and_then(|v| v.parse().ok()),
                "period" => q.period = value.and_then(|v| v.parse().ok()),
                "nowait" => q.nowait = true,
                "stop_after_bytes" => q.stop_after_bytes = value.and_then(|v| v.parse().ok()),
                "entries_only" => q.entries_only = true,
                "array" => {
                    q.array = true;
                    q.entries_only = true;
                }
                "checked" => q.checked = true,
                "json" => {
                    q.json = match value.as_deref() {
                        Some("minimalistic") => Some(JsonDialect::Minimalistic),
                        Some("js") => Some(JsonDialect::Js),
                        Some("fs") => Some(JsonDialect::Fs),
                        _ => None,
                    }
                }
                "sizeonly" => q.sizeonly = true,
                "schema" => q.schema = Some(value),
                "terminate" => q.terminate = value,
                _ => {}
            }
        }
        q
    }

    /// `schema.<lang>` as a path suffix is equivalent to `?schema=<lang>`.
    pub fn with_path_schema(mut self, lang: Option<String>) -> Self {
        if lang.is_some() {
            self.schema = Some(lang);
        }
        self
    }
}

fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_and_output_shaping() {
        let q = StreamQuery::parse("since=201&period=200&nowait");
        assert_eq!(q.since, Some(201));
        assert_eq!(q.period, Some(200));
        assert!(q.nowait);
    }

    #[test]
    fn array_implies_entries_only() {
        let q = StreamQuery::parse("n=2&array");
        assert!(q.array);
        assert!(q.entries_only);
    }

    #[test]
    fn bare_schema_vs_schema_with_lang() {
        let bare = StreamQuery::parse("schema");
        assert_eq!(bare.schema, Some(None));
        let lang = StreamQuery::parse("schema=fs");
        assert_eq!(lang.schema, Some(Some("fs".to_string())));
    }

    #[test]
    fn decodes_percent_and_plus() {
        let q = StreamQuery::parse("terminate=abc%2Bdef");
        assert_eq!(q.terminate, Some("abc+def".to_string()));
    }
}
