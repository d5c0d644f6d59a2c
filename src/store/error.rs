use std::fmt;
use std::io;

use crate::store::naming::SuffixError;

/// Why a connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Network,
    AuthRejected,
    Timeout,
    HostKeyRejected,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectFailure::Network => "network error",
            ConnectFailure::AuthRejected => "authentication rejected",
            ConnectFailure::Timeout => "timed out",
            ConnectFailure::HostKeyRejected => "host key rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ConnectError {
    pub kind: ConnectFailure,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no plugin location selected")]
    NotConfigured,

    #[error("remote session is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectError),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("{name}: {reason}")]
    InvalidState { name: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid install source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    InvalidSuffix(#[from] SuffixError),
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
