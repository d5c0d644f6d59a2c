use std::io::{self, Read, Write};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::error::ConnectError;
use crate::store::remote::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bounds TCP connect, key exchange and authentication.
    pub connect: Duration,
    /// Applied to every blocking call once the session is up.
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            operation: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no such file: {0}")]
    NotFound(String),

    /// The session itself is gone; the channel must not be reused.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Opens authenticated file-transfer channels.
pub trait Connector: Send {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeouts: Timeouts,
    ) -> Result<Box<dyn Channel>, ConnectError>;
}

/// An open file-transfer channel. Paths are absolute remote paths; callers
/// own the directory/file joining.
pub trait Channel: Send {
    fn is_healthy(&self) -> bool;

    /// Raw directory listing; may include `.` and `..`.
    fn list(&mut self, dir: &str) -> Result<Vec<String>, ChannelError>;

    /// Writes `reader` to `path`, truncating any existing file. Returns only
    /// once the server has acknowledged every write.
    fn upload(
        &mut self,
        reader: &mut dyn Read,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ChannelError>;

    fn download(
        &mut self,
        path: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<u64, ChannelError>;

    /// Renames `from` to `to`, replacing `to` when `replace` is set.
    fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<(), ChannelError>;

    fn remove(&mut self, path: &str) -> Result<(), ChannelError>;

    /// Closes the transfer channel, then the connection underneath it.
    fn close(&mut self);
}

/// Joins a remote directory and a file name, adding a separator only when
/// the directory does not already end with one.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
