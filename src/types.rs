//! Core data types shared by every component: the `{index, us}` pair,
//! the HEAD/last-record snapshot, and the signature used to detect schema
//! drift across log opens.

use serde::{Deserialize, Serialize};

/// `{index, us}` bound to every published record. `index` is 0-based and
/// dense; `us` is the record's epoch-microsecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexTimestamp {
    pub index: u64,
    pub us: i64,
}

impl IndexTimestamp {
    pub fn new(index: u64, us: i64) -> Self {
        Self { index, us }
    }
}

/// Atomic snapshot of `{head, last_published}` returned by
/// `Persister::head_and_last` and used by subscribers and the flip protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadAndMaybeLast {
    pub head: i64,
    pub idxts: Option<IndexTimestamp>,
}

impl HeadAndMaybeLast {
    pub fn empty() -> Self {
        Self {
            head: -1,
            idxts: None,
        }
    }
}

/// A line read back from the log, before it has been dispatched to a typed
/// record or a head-update.
#[derive(Debug, Clone)]
pub enum LogLine {
    Record { idxts: IndexTimestamp, payload_json: String },
    HeadUpdate { us: i64 },
}

/// Per-field structural description, recursively flattened. Order matters:
/// reordering fields changes the computed type id, same as renaming one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: &'static str,
    pub type_name: &'static str,
}

/// Structural identity of an entry type: a stable 64-bit id plus the field
/// list it was computed from. Two independently compiled binaries with
/// identical entry definitions compute the same `type_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub type_id: u64,
    pub fields: Vec<FieldInfo>,
}

impl SchemaInfo {
    /// Computes a `SchemaInfo` from an ordered field list via a BLAKE3 hash
    /// of the canonical `name:type_name` sequence, truncated to 64 bits.
    pub fn from_fields(fields: &[(&'static str, &'static str)]) -> Self {
        let mut canonical = String::new();
        for (name, type_name) in fields {
            canonical.push_str(name);
            canonical.push(':');
            canonical.push_str(type_name);
            canonical.push(';');
        }
        let digest = blake3::hash(canonical.as_bytes());
        let bytes = digest.as_bytes();
        let type_id = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        Self {
            type_id,
            fields: fields
                .iter()
                .map(|(name, type_name)| FieldInfo { name, type_name })
                .collect(),
        }
    }
}

/// `{namespace_name, entry_name, schema_info}`, prepended to a persisted log
/// as the first line. Two signatures compare equal iff all three fields
/// match byte-for-byte after canonical (serde_json) serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub namespace_name: String,
    pub entry_name: String,
    pub schema_info: SchemaInfo,
}

impl Signature {
    pub fn new(namespace_name: impl Into<String>, entry_name: impl Into<String>, schema_info: SchemaInfo) -> Self {
        Self {
            namespace_name: namespace_name.into(),
            entry_name: entry_name.into(),
            schema_info,
        }
    }

    pub fn matches(&self, other: &Signature) -> bool {
        self == other
    }
}

/// The generic trait a stream's record type implements. Analogous to a
/// `CURRENT_STRUCT` in the source framework: it must serialize to single-line
/// JSON and know its own structural schema.
pub trait StreamEntry: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    const ENTRY_NAME: &'static str;
    fn schema_info() -> SchemaInfo;
}
