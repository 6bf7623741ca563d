//! Error types for redshard.
//!
//! Nothing in this crate retries. Every error propagates to the caller, who
//! decides (usually through [`RedshardError::is_fatal`]) whether the
//! connection it was using may be reused.

use std::io;
use thiserror::Error;

/// Result type alias using [`RedshardError`].
pub type Result<T> = std::result::Result<T, RedshardError>;

/// Structured server error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// EXECABORT Transaction discarded because of previous errors
    ExecAbort,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY the server is busy running a script
    Busy,
    /// LOADING the dataset is being loaded in memory
    Loading,
    /// NOAUTH Authentication required
    NoAuth,
    /// Any other error prefix
    Other(String),
}

impl ServerErrorKind {
    /// Classify a server error message by its leading token.
    pub fn from_error_msg(msg: &str) -> Self {
        let prefix = msg.split_whitespace().next().unwrap_or("");
        match prefix {
            "ERR" => Self::Err,
            "WRONGTYPE" => Self::WrongType,
            "EXECABORT" => Self::ExecAbort,
            "NOSCRIPT" => Self::NoScript,
            "BUSY" => Self::Busy,
            "LOADING" => Self::Loading,
            "NOAUTH" => Self::NoAuth,
            "" => Self::Other("UNKNOWN".to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// All error variants for redshard.
#[derive(Debug, Error)]
pub enum RedshardError {
    /// Socket could not be opened or was closed underneath us.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Malformed reply. The stream is desynchronized and cannot be reused.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The parser needs more bytes. Never escapes a `Connection`.
    #[error("incomplete RESP message")]
    Incomplete,

    /// The server answered with an error reply.
    #[error("server error: {message}")]
    Server {
        kind: ServerErrorKind,
        message: String,
    },

    /// Number of replies read does not match the number of commands sent.
    #[error("reply queue mismatch: expected {expected} replies, got {actual}")]
    QueueMismatch { expected: usize, actual: usize },

    /// Connect or read deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A typed getter received a reply of another shape.
    #[error("type error: {0}")]
    Type(String),

    /// Invalid URL, shard weight, duplicate shard id, ...
    #[error("config error: {0}")]
    Config(String),

    /// No shard can serve the request.
    #[error("sharding error: {0}")]
    Sharding(String),

    /// The API was used in a way the protocol does not allow.
    #[error("usage error: {0}")]
    Usage(String),
}

impl RedshardError {
    /// Create a server error from a raw error message, classifying its kind.
    pub fn server(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = ServerErrorKind::from_error_msg(&message);
        Self::Server { kind, message }
    }

    /// True when the connection that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Protocol(_)
                | Self::Incomplete
                | Self::QueueMismatch { .. }
                | Self::Timeout(_)
        )
    }

    /// The server error kind, if this is a server error.
    pub fn server_kind(&self) -> Option<&ServerErrorKind> {
        match self {
            Self::Server { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
