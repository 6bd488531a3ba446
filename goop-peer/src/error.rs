//! Typed error kinds shared across the peer runtime.
//!
//! Mirrors the error taxonomy a caller needs to branch on (retry vs. give up
//! vs. surface to a UI), rather than collapsing everything into a single
//! opaque variant. Binary/glue code is free to widen these into `anyhow`.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum GoopError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("path escapes root: {0}")]
    OutsideRoot(String),

    #[error("rate limited")]
    RateLimited,

    #[error("peer does not support protocol: {0}")]
    UnsupportedByPeer(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl GoopError {
    pub fn kind(&self) -> &'static str {
        match self {
            GoopError::Validation(_) => "Validation",
            GoopError::NotFound(_) => "NotFound",
            GoopError::Forbidden(_) => "Forbidden",
            GoopError::Conflict(_) => "Conflict",
            GoopError::OutsideRoot(_) => "OutsideRoot",
            GoopError::RateLimited => "RateLimited",
            GoopError::UnsupportedByPeer(_) => "UnsupportedByPeer",
            GoopError::Unreachable(_) => "Unreachable",
            GoopError::Timeout(_) => "Timeout",
            GoopError::ProtocolError(_) => "ProtocolError",
            GoopError::ChannelClosed => "ChannelClosed",
            GoopError::Fatal(_) => "Fatal",
            GoopError::Io(_) => "Io",
            GoopError::Sqlite(_) => "Sqlite",
        }
    }
}

/// A `log:<kind>` event as described in spec.md §7, published to the MQ bus
/// so UIs can present failures without coupling to the failing subsystem.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEvent {
    pub source: String,
    pub level: LogLevel,
    pub msg: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

pub type GoopResult<T> = Result<T, GoopError>;
