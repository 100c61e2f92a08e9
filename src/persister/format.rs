//! Line-based on-disk/in-memory log format, shared by every persister
//! backend, the replication follower's chunk dispatcher, and the HTTP
//! endpoint's raw passthrough mode.
//!
//! ```text
//! #signature <one-line-JSON>\n            (only as the first line)
//! <JSON(idxts)>\t<JSON(payload)>\n         (a record)
//! #head <20-digit zero-padded us>\n       (a head-update directive)
//! ```

use crate::error::{Error, Result};
use crate::types::{IndexTimestamp, Signature};

pub const SIGNATURE_DIRECTIVE: &str = "#signature";
pub const HEAD_DIRECTIVE: &str = "#head";
pub const HEAD_DIGITS: usize = 20;

/// One parsed line of the log, or the signature line.
#[derive(Debug, Clone)]
pub enum ParsedLine {
    Signature(Signature),
    Record { idxts: IndexTimestamp, payload_json: String },
    Head { us: i64 },
}

/// Parses a single line (without its trailing `\n`/`\r`). Directives start
/// with `#`; everything else must be `JSON(idxts) \t JSON(payload)`.
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    if let Some(rest) = line.strip_prefix(SIGNATURE_DIRECTIVE) {
        let json = rest.trim_start();
        let sig: Signature = serde_json::from_str(json)?;
        return Ok(ParsedLine::Signature(sig));
    }
    if let Some(rest) = line.strip_prefix(HEAD_DIRECTIVE) {
        let digits = rest.trim();
        let us: i64 = digits
            .parse()
            .map_err(|_| Error::MalformedEntry(line.to_string()))?;
        return Ok(ParsedLine::Head { us });
    }
    let tab_pos = line
        .find('\t')
        .ok_or_else(|| Error::MalformedEntry(line.to_string()))?;
    let idxts: IndexTimestamp = serde_json::from_str(&line[..tab_pos])?;
    let payload_json = line[tab_pos + 1..].to_string();
    Ok(ParsedLine::Record { idxts, payload_json })
}

/// Parses only the leading `idxts`, ignoring the payload — used by
/// `publish_unsafe` and the replication follower's checked-index mode, which
/// never deserialize the payload.
pub fn parse_idxts_prefix(line: &str) -> Result<IndexTimestamp> {
    let tab_pos = line
        .find('\t')
        .ok_or_else(|| Error::MalformedEntry(line.to_string()))?;
    Ok(serde_json::from_str(&line[..tab_pos])?)
}

pub fn format_record_line(idxts: IndexTimestamp, payload_json: &str) -> String {
    format!(
        "{}\t{}\n",
        serde_json::to_string(&idxts).expect("IndexTimestamp always serializes"),
        payload_json
    )
}

pub fn format_head_line(us: i64) -> String {
    format!("{HEAD_DIRECTIVE} {:0width$}\n", us, width = HEAD_DIGITS)
}

pub fn format_signature_line(sig: &Signature) -> String {
    format!(
        "{SIGNATURE_DIRECTIVE} {}\n",
        serde_json::to_string(sig).expect("Signature always serializes")
    )
}

/// `\r` is tolerated as a terminator on read; split a buffer into complete
/// lines plus whatever trailing partial bytes remain (no terminator yet).
pub fn split_lines(buf: &str) -> (Vec<&str>, &str) {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = buf.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut end = i;
            if end > start && bytes[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(&buf[start..end]);
            start = i + 1;
        }
        i += 1;
    }
    (lines, &buf[start..])
}
