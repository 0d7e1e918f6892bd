//! Error types for the station fabric

use thiserror::Error;

/// Structural problems with a received frame list
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("too few frames: {0}")]
    TooFewFrames(usize),

    #[error("description frame too short: {0} bytes")]
    DescriptionTooShort(usize),

    #[error("declared frame size {0} exceeds the limit")]
    TooManyFrames(usize),

    #[error("invalid command byte 0x{0:02x}")]
    InvalidCommand(u8),

    #[error("declared frame size {declared} does not match {actual} frames (description {description_len} bytes)")]
    SizeMismatch {
        declared: usize,
        actual: usize,
        description_len: usize,
    },
}

/// How bad a transport failure is for the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Log, count and keep polling
    Transient,
    /// Tear the station down
    Fatal,
}

/// Socket level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {reason}")]
    Bind { endpoint: String, reason: String },

    #[error("failed to connect {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("peer {0} is not routable")]
    Unroutable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("socket queue full")]
    WouldBlock,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("operation not supported on {0} socket")]
    Unsupported(&'static str),

    #[error("station has no {0} socket")]
    NoSocket(&'static str),

    #[error("socket closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn severity(&self) -> Severity {
        match self {
            TransportError::Closed | TransportError::Bind { .. } => Severity::Fatal,
            _ => Severity::Transient,
        }
    }
}

/// Record store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("field {field} is reserved")]
    ReservedField { field: String },
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate station name: {0}")]
    DuplicateStation(String),

    #[error("unknown station: {0}")]
    UnknownStation(String),
}

/// Station engine failures
#[derive(Debug, Error)]
pub enum StationError {
    #[error("station {0} is not registered")]
    UnknownStation(String),

    #[error("station {0} was closed before it started")]
    ClosedBeforeStart(String),

    #[error("station {station} cannot start from state {state}")]
    NotStartable { station: String, state: String },

    #[error("socket setup failed for {role}: {source}")]
    Setup {
        role: &'static str,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
