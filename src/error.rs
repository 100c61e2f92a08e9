//! Error taxonomy for the stream subsystem.
//!
//! One enum covers persistence, lifecycle, and replication failures. Nothing
//! here is swallowed silently; `StreamTerminatedBySubscriber` is the sole
//! internal control-flow signal and is never meant to reach an end user (see
//! `subscription::run_scheduler_loop`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("inconsistent index: expected {expected}, found {found}")]
    InconsistentIndex { expected: u64, found: u64 },

    #[error("inconsistent timestamp: head is {head_us}us, attempted {attempted_us}us")]
    InconsistentTimestamp { head_us: i64, attempted_us: i64 },

    #[error("malformed entry: {0:?}")]
    MalformedEntry(String),

    #[error("invalid stream signature: {0}")]
    InvalidStreamSignature(String),

    #[error("signature directive found outside the first line of the file")]
    InvalidSignatureLocation,

    #[error("invalid iterable range: begin={begin}, end={end}, size={size}")]
    InvalidIterableRange { begin: u64, end: u64, size: u64 },

    #[error("no entries have been published yet")]
    NoEntriesPublishedYet,

    #[error("persistence file not writable: {0}")]
    PersistenceFileNotWritable(String),

    #[error("unsafe publish: bad index/timestamp, expected index {expected}, found {found}")]
    UnsafePublishBadIndexTimestamp { expected: u64, found: u64 },

    #[error("publisher not available: stream is in Following state")]
    PublisherNotAvailable,

    #[error("stream is already master")]
    StreamIsAlreadyMaster,

    #[error("stream is already following")]
    StreamIsAlreadyFollowing,

    #[error("stream is already exposed via HTTP")]
    StreamIsAlreadyExposed,

    #[error("stream is not exposed via HTTP")]
    StreamIsNotExposed,

    #[error("stream does not follow anyone")]
    StreamDoesNotFollowAnyone,

    #[error("remote stream does not respond: {0}")]
    RemoteStreamDoesNotRespond(String),

    #[error("remote stream has an invalid schema: {0}")]
    RemoteStreamInvalidSchema(String),

    #[error("remote stream sent a malformed chunk: {0}")]
    RemoteStreamMalformedChunk(String),

    #[error("remote stream refused the flip request: {0}")]
    RemoteStreamRefusedFlipRequest(String),

    /// Internal control-flow signal used by the replication follower and HTTP
    /// subscriber loops to unwind cleanly. Never surfaced past those loops.
    #[error("stream terminated by subscriber")]
    StreamTerminatedBySubscriber,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
