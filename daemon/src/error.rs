//! Error types for the edges of the engine
//!
//! Event handling inside the engine never fails; anomalies are counted.
//! Only record decoding and configuration produce typed errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{0} is not a supported address family")]
    UnsupportedFamily(u8),
    #[error("{0} is not a supported transport protocol")]
    UnsupportedTransport(u8),
    #[error("{0} is not a valid connection event kind")]
    InvalidEventKind(u8),
    #[error("{0} is not a valid direction")]
    InvalidDirection(u8),
    #[error("{0} is not a valid TCP state")]
    InvalidTcpState(u8),
    #[error("{0} is not a known TLS library")]
    UnknownTlsLibrary(u8),
    #[error("sample length {len} exceeds capacity {max}")]
    SampleTooLong { len: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
