//! In-memory SFTP stand-in with fault injection, for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::store::error::{ConnectError, ConnectFailure};
use crate::store::remote::endpoint::{Auth, DEFAULT_SSH_PORT, Endpoint};
use crate::store::remote::transport::{Channel, ChannelError, Connector, Timeouts};

#[derive(Debug, Default)]
pub struct MemoryServer {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub password: String,
    pub reachable: bool,
    /// Cleared to simulate the peer dropping the session.
    pub alive: bool,
    pub channel_open: bool,
    /// Uploads write this many bytes, then the connection dies.
    pub drop_after_bytes: Option<u64>,
    /// Uploads store their bytes but the final write acknowledgement fails.
    pub reject_on_close: bool,
    /// Each primitive holds its slot this long before touching any file.
    pub op_delay: Duration,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub connects: usize,
    pub closes: usize,
    /// Primitive calls that reached the server.
    pub calls: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: Arc<Mutex<MemoryServer>>,
}

impl MemoryConnector {
    pub fn new(password: &str, dir: &str) -> Self {
        let mut server = MemoryServer {
            password: password.to_string(),
            reachable: true,
            ..Default::default()
        };
        server.dirs.insert(normalize_dir(dir).to_string());

        Self {
            server: Arc::new(Mutex::new(server)),
        }
    }

    pub fn server(&self) -> MutexGuard<'_, MemoryServer> {
        lock(&self.server)
    }
}

fn lock(server: &Mutex<MemoryServer>) -> MutexGuard<'_, MemoryServer> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks one primitive as running on the server until dropped.
struct InFlight(Arc<Mutex<MemoryServer>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.0).in_flight -= 1;
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _timeouts: Timeouts,
    ) -> Result<Box<dyn Channel>, ConnectError> {
        let mut server = self.server();
        if !server.reachable {
            return Err(ConnectError::new(
                ConnectFailure::Network,
                format!("{}: connection refused", endpoint.host),
            ));
        }

        let accepted = match &endpoint.auth {
            Auth::Password(password) => password.expose_secret() == server.password,
            Auth::PrivateKey { .. } => false,
        };
        if !accepted {
            return Err(ConnectError::new(
                ConnectFailure::AuthRejected,
                format!("{} refused the credentials", endpoint.username),
            ));
        }

        server.connects += 1;
        server.alive = true;
        server.channel_open = true;

        Ok(Box::new(MemoryChannel {
            server: Arc::clone(&self.server),
            open: true,
        }))
    }
}

struct MemoryChannel {
    server: Arc<Mutex<MemoryServer>>,
    open: bool,
}

impl MemoryChannel {
    fn begin(&self) -> InFlight {
        let delay = {
            let mut server = lock(&self.server);
            server.in_flight += 1;
            server.max_in_flight = server.max_in_flight.max(server.in_flight);
            server.op_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        InFlight(Arc::clone(&self.server))
    }

    fn server(&self) -> Result<MutexGuard<'_, MemoryServer>, ChannelError> {
        let mut server = lock(&self.server);
        if !self.open || !server.alive {
            return Err(ChannelError::Transport("connection reset".into()));
        }
        server.calls += 1;
        Ok(server)
    }
}

impl Channel for MemoryChannel {
    fn is_healthy(&self) -> bool {
        self.open && lock(&self.server).alive
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, ChannelError> {
        let _in_flight = self.begin();
        let server = self.server()?;
        let dir = normalize_dir(dir);
        if !server.dirs.contains(dir) {
            return Err(ChannelError::NotFound(dir.to_string()));
        }

        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(server.files.keys().filter_map(|path| {
            let (parent, name) = path.rsplit_once('/')?;
            (parent == dir).then(|| name.to_string())
        }));
        Ok(names)
    }

    fn upload(
        &mut self,
        reader: &mut dyn Read,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ChannelError> {
        let _in_flight = self.begin();
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        let mut server = self.server()?;
        if let Some(limit) = server.drop_after_bytes
            && (data.len() as u64) > limit
        {
            data.truncate(limit as usize);
            server.files.insert(path.to_string(), data);
            server.alive = false;
            return Err(ChannelError::Transport("connection reset mid-transfer".into()));
        }

        let written = data.len() as u64;
        server.files.insert(path.to_string(), data);
        if server.reject_on_close {
            return Err(io::Error::other("write failed: quota exceeded").into());
        }
        Ok(written)
    }

    fn download(
        &mut self,
        path: &str,
        writer: &mut dyn Write,
        _cancel: &CancellationToken,
    ) -> Result<u64, ChannelError> {
        let _in_flight = self.begin();
        let server = self.server()?;
        let data = server
            .files
            .get(path)
            .ok_or_else(|| ChannelError::NotFound(path.to_string()))?;
        writer.write_all(data)?;
        Ok(data.len() as u64)
    }

    fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<(), ChannelError> {
        let _in_flight = self.begin();
        let mut server = self.server()?;
        if !server.files.contains_key(from) {
            return Err(ChannelError::NotFound(from.to_string()));
        }
        if !replace && server.files.contains_key(to) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target exists").into());
        }

        if let Some(data) = server.files.remove(from) {
            server.files.insert(to.to_string(), data);
        }
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), ChannelError> {
        let _in_flight = self.begin();
        let mut server = self.server()?;
        server
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| ChannelError::NotFound(path.to_string()))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut server = lock(&self.server);
            server.channel_open = false;
            server.closes += 1;
        }
    }
}

fn normalize_dir(dir: &str) -> &str {
    dir.trim_end_matches('/')
}

pub fn password_endpoint(password: &str, dir: &str) -> Endpoint {
    Endpoint {
        host: "mc.example.org".to_string(),
        port: DEFAULT_SSH_PORT,
        username: "steve".to_string(),
        auth: Auth::Password(SecretString::from(password.to_string())),
        path: dir.to_string(),
    }
}
