use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::store::error::{StoreError, StoreResult};
use crate::store::remote::endpoint::Endpoint;
use crate::store::remote::transport::{Channel, ChannelError, Connector, Timeouts, join_remote};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One authenticated transfer channel and its lifecycle.
///
/// Every primitive refuses to run unless the session is connected, and a
/// transport failure during a primitive drops the channel and leaves the
/// session `Failed` until the caller connects again. Transfers take the
/// token of the request they belong to.
pub struct RemoteSession {
    connector: Box<dyn Connector>,
    channel: Option<Box<dyn Channel>>,
    status: ConnectionStatus,
    endpoint: Option<Endpoint>,
}

impl RemoteSession {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            channel: None,
            status: ConnectionStatus::Disconnected,
            endpoint: None,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn connect(&mut self, endpoint: Endpoint, timeouts: Timeouts) -> StoreResult<()> {
        self.disconnect();
        self.status = ConnectionStatus::Connecting;
        tracing::info!("connecting to {endpoint}");

        let result = self.connector.connect(&endpoint, timeouts);
        self.endpoint = Some(endpoint);

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                self.status = ConnectionStatus::Connected;
                tracing::info!("connected");
                Ok(())
            }
            Err(err) => {
                tracing::warn!("connect failed: {err}");
                self.status = ConnectionStatus::Failed(err.to_string());
                Err(err.into())
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            tracing::info!("disconnected");
        }
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
            && self.channel.as_ref().is_some_and(|channel| channel.is_healthy())
    }

    /// Fails with `NotConnected` unless the channel is up. A channel the peer
    /// dropped between calls demotes the session to `Failed`.
    pub fn ensure_connected(&mut self) -> StoreResult<()> {
        if self.status != ConnectionStatus::Connected {
            return Err(StoreError::NotConnected);
        }

        if !self.is_connected() {
            self.fail("remote peer closed the session".to_string());
            return Err(StoreError::NotConnected);
        }

        Ok(())
    }

    pub fn list_remote(&mut self, dir: &str) -> StoreResult<Vec<String>> {
        self.run("list", dir, |channel| channel.list(dir))
    }

    /// Uploads `local` into `dir` as `name`. Callers that keep the local
    /// file name pass it here.
    pub fn upload(
        &mut self,
        local: &Path,
        dir: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        let path = join_remote(dir, name);
        self.run("upload", name, |channel| {
            let mut file = fs::File::open(local)?;
            if !file.metadata()?.is_file() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file").into());
            }
            channel.upload(&mut file, &path, cancel)
        })
    }

    /// Downloads `remote_path` into `local`. The local file only appears once
    /// the transfer completed.
    pub fn download(
        &mut self,
        remote_path: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        self.ensure_connected()?;

        let parent = local
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| StoreError::io(format!("stage {}", local.display()), e))?;

        let written = self.run("download", remote_path, |channel| {
            channel.download(remote_path, staged.as_file_mut(), cancel)
        })?;

        staged
            .persist(local)
            .map_err(|e| StoreError::io(format!("save {}", local.display()), e.error))?;
        Ok(written)
    }

    pub fn rename(&mut self, dir: &str, old_name: &str, new_name: &str) -> StoreResult<()> {
        let from = join_remote(dir, old_name);
        let to = join_remote(dir, new_name);
        self.run("rename", old_name, |channel| channel.rename(&from, &to, false))
    }

    /// Like `rename`, but replaces an existing `new_name`.
    pub fn replace(&mut self, dir: &str, old_name: &str, new_name: &str) -> StoreResult<()> {
        let from = join_remote(dir, old_name);
        let to = join_remote(dir, new_name);
        self.run("rename", old_name, |channel| channel.rename(&from, &to, true))
    }

    pub fn delete(&mut self, dir: &str, name: &str) -> StoreResult<()> {
        let path = join_remote(dir, name);
        self.run("delete", name, |channel| channel.remove(&path))
    }

    fn run<T>(
        &mut self,
        verb: &str,
        subject: &str,
        op: impl FnOnce(&mut dyn Channel) -> Result<T, ChannelError>,
    ) -> StoreResult<T> {
        self.ensure_connected()?;

        let Some(channel) = self.channel.as_mut() else {
            return Err(StoreError::NotConnected);
        };

        let result = op(channel.as_mut());
        result.map_err(|err| match err {
            ChannelError::NotFound(_) => StoreError::NotFound(subject.to_string()),
            ChannelError::Cancelled => StoreError::Cancelled,
            ChannelError::Io(source) if source.kind() == io::ErrorKind::Interrupted => {
                StoreError::Cancelled
            }
            ChannelError::Io(source) => StoreError::io(format!("{verb} {subject}"), source),
            ChannelError::Transport(reason) => {
                tracing::warn!("{verb} {subject}: transport failure: {reason}");
                self.fail(reason.clone());
                StoreError::io(
                    format!("{verb} {subject}"),
                    io::Error::new(io::ErrorKind::ConnectionAborted, reason),
                )
            }
        })
    }

    fn fail(&mut self, reason: String) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.status = ConnectionStatus::Failed(reason);
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
