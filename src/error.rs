//! Error taxonomy for the mesh engine.
//!
//! Errors are grouped by failure domain. Decode, mutation and loop-guard
//! errors are normal mesh traffic and are recovered locally (counted and
//! dropped); link and cloud errors drive the retry machinery; engine command
//! errors are returned synchronously to the caller.

use thiserror::Error;

/// Wire decode failures.
///
/// Timestamp skew is deliberately NOT an error: a packet from a node with a
/// wrong clock is still a real emergency. The decoder accepts it and flags it
/// (`Decoded::timestamp_skewed`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("not valid UTF-8 JSON: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has wrong type, expected {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    #[error("trace invalid: {0}")]
    TraceInvalid(String),
    #[error("ttl {0} outside [0, {max}]", max = crate::types::MAX_TTL)]
    TtlOutOfRange(i64),
    #[error("frame truncated: declared {declared} bytes, got {actual}")]
    FrameTruncated { declared: usize, actual: usize },
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
}

/// Rejected packet mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("node `{0}` already present in trace")]
    AlreadyVisited(String),
    #[error("ttl exhausted")]
    TtlExhausted,
}

/// Link-layer transmission failures, as classified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("connect/send timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("link busy")]
    Busy,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("remote answered with unexpected byte {0:#04x}")]
    InvalidAck(u8),
    #[error("link error: {0}")]
    Unknown(String),
}

impl LinkError {
    /// Busy and timeout are expected on a contended half-duplex link and are
    /// retried without raising the log level.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Timeout | LinkError::Busy)
    }
}

/// Durable store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage not initialized")]
    NotInitialized,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Cloud sink failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// 4xx — the record is malformed from the sink's point of view.
    /// Retrying an identical body cannot help.
    #[error("cloud rejected request: HTTP {0}")]
    ClientError(u16),
    /// 5xx — sink-side trouble, retry next cycle.
    #[error("cloud server error: HTTP {0}")]
    ServerError(u16),
    #[error("cloud request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

impl CloudError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CloudError::ClientError(_))
    }
}

/// Engine command errors, returned synchronously to the host.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,
    #[error("engine already started")]
    AlreadyStarted,
    #[error("link layer: {0}")]
    LinkLayer(#[from] LinkError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("validation: {0}")]
    Validation(String),
}
