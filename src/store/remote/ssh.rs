use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::ExposeSecret;
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, RenameFlags, Session, Sftp};
use tokio_util::sync::CancellationToken;

use crate::store::cancel::copy_with_cancel;
use crate::store::error::{ConnectError, ConnectFailure};
use crate::store::remote::endpoint::{Auth, DEFAULT_SSH_PORT, Endpoint, HostKeyPolicy};
use crate::store::remote::transport::{Channel, ChannelError, Connector, Timeouts};

// libssh2 error codes
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Opens SFTP channels over SSH with libssh2.
#[derive(Debug, Clone)]
pub struct SshConnector {
    known_hosts: PathBuf,
    policy: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(known_hosts: PathBuf, policy: HostKeyPolicy) -> Self {
        Self {
            known_hosts,
            policy,
        }
    }

    fn verify_host_key(&self, session: &Session, endpoint: &Endpoint) -> Result<(), ConnectError> {
        if self.policy == HostKeyPolicy::Insecure {
            tracing::warn!(
                "host key verification is disabled for {}; the server identity is not checked",
                endpoint.host
            );
            return Ok(());
        }

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| ConnectError::new(ConnectFailure::HostKeyRejected, "server sent no host key"))?;

        let mut known = session
            .known_hosts()
            .map_err(|e| ConnectError::new(ConnectFailure::HostKeyRejected, e.to_string()))?;

        if self.known_hosts.exists() {
            known
                .read_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| {
                    ConnectError::new(
                        ConnectFailure::HostKeyRejected,
                        format!("read {}: {e}", self.known_hosts.display()),
                    )
                })?;
        }

        match known.check_port(&endpoint.host, endpoint.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(ConnectError::new(
                ConnectFailure::HostKeyRejected,
                format!(
                    "host key for {} does not match {}",
                    endpoint.host,
                    self.known_hosts.display()
                ),
            )),
            CheckResult::NotFound if self.policy == HostKeyPolicy::AcceptNew => {
                let entry = known_hosts_entry(&endpoint.host, endpoint.port);
                known
                    .add(&entry, key, "added by plugshelf", key_type.into())
                    .and_then(|()| {
                        if let Some(parent) = self.known_hosts.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        known.write_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                    })
                    .map_err(|e| {
                        ConnectError::new(
                            ConnectFailure::HostKeyRejected,
                            format!("record host key for {entry}: {e}"),
                        )
                    })?;
                tracing::info!("recorded new host key for {entry}");
                Ok(())
            }
            CheckResult::NotFound => Err(ConnectError::new(
                ConnectFailure::HostKeyRejected,
                format!(
                    "{} is not in {}; add it or set host_key_policy = \"accept-new\"",
                    endpoint.host,
                    self.known_hosts.display()
                ),
            )),
            CheckResult::Failure => Err(ConnectError::new(
                ConnectFailure::HostKeyRejected,
                "known_hosts check failed",
            )),
        }
    }

    fn open_sftp(
        &self,
        session: &mut Session,
        endpoint: &Endpoint,
        timeouts: Timeouts,
    ) -> Result<Sftp, ConnectError> {
        session
            .handshake()
            .map_err(|e| classify(&e, ConnectFailure::Network))?;

        self.verify_host_key(session, endpoint)?;
        authenticate(session, endpoint)?;

        let sftp = session
            .sftp()
            .map_err(|e| classify(&e, ConnectFailure::Network))?;

        session.set_timeout(millis(timeouts.operation));
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        Ok(sftp)
    }
}

impl Connector for SshConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeouts: Timeouts,
    ) -> Result<Box<dyn Channel>, ConnectError> {
        let tcp = open_tcp(endpoint, timeouts.connect)?;

        let mut session =
            Session::new().map_err(|e| ConnectError::new(ConnectFailure::Network, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(timeouts.connect));

        match self.open_sftp(&mut session, endpoint, timeouts) {
            Ok(sftp) => Ok(Box::new(SshChannel {
                session,
                sftp: Some(sftp),
                alive: true,
            })),
            Err(err) => {
                if let Err(e) = session.disconnect(None, "connect aborted", None) {
                    tracing::debug!("disconnect after failed connect: {e}");
                }
                Err(err)
            }
        }
    }
}

struct SshChannel {
    session: Session,
    sftp: Option<Sftp>,
    alive: bool,
}

impl SshChannel {
    fn sftp(&self) -> Result<&Sftp, ChannelError> {
        match self.sftp.as_ref() {
            Some(sftp) if self.alive => Ok(sftp),
            _ => Err(ChannelError::Transport("channel closed".into())),
        }
    }

    fn sftp_failure(&mut self, err: ssh2::Error) -> ChannelError {
        match err.code() {
            ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => ChannelError::NotFound(err.message().to_string()),
            ErrorCode::SFTP(_) => ChannelError::Io(err.into()),
            ErrorCode::Session(_) => {
                self.alive = false;
                ChannelError::Transport(err.to_string())
            }
        }
    }

    /// Stream errors lose the libssh2 code, so probe the session to tell a
    /// dead connection from a plain I/O error.
    fn stream_failure(&mut self, err: io::Error) -> ChannelError {
        if err.kind() == io::ErrorKind::Interrupted {
            return ChannelError::Cancelled;
        }

        let probe = match self.sftp() {
            Ok(sftp) => sftp.realpath(Path::new(".")),
            Err(closed) => return closed,
        };
        match probe {
            Err(probe_err) if matches!(probe_err.code(), ErrorCode::Session(_)) => {
                self.alive = false;
                ChannelError::Transport(err.to_string())
            }
            _ => ChannelError::Io(err),
        }
    }
}

impl Channel for SshChannel {
    fn is_healthy(&self) -> bool {
        self.alive && self.sftp.is_some() && self.session.keepalive_send().is_ok()
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, ChannelError> {
        let result = self.sftp()?.readdir(Path::new(dir));
        match result {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter_map(|(path, _)| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(str::to_string)
                })
                .collect()),
            Err(err) => Err(self.sftp_failure(err)),
        }
    }

    fn upload(
        &mut self,
        reader: &mut dyn Read,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, ChannelError> {
        let created = self.sftp()?.create(Path::new(path));
        let mut remote = match created {
            Ok(file) => file,
            Err(err) => return Err(self.sftp_failure(err)),
        };

        let written = match copy_with_cancel(reader, &mut remote, cancel) {
            Ok(written) => written,
            Err(err) => return Err(self.stream_failure(err)),
        };

        // Writes are pipelined; a rejected write can first surface at close.
        match remote.close() {
            Ok(()) => Ok(written),
            Err(err) => Err(self.sftp_failure(err)),
        }
    }

    fn download(
        &mut self,
        path: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<u64, ChannelError> {
        let opened = self.sftp()?.open(Path::new(path));
        let mut remote = match opened {
            Ok(file) => file,
            Err(err) => return Err(self.sftp_failure(err)),
        };

        match copy_with_cancel(&mut remote, writer, cancel) {
            Ok(read) => Ok(read),
            Err(err) => Err(self.stream_failure(err)),
        }
    }

    fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<(), ChannelError> {
        let (from, to) = (Path::new(from), Path::new(to));
        let target_exists = self.sftp()?.stat(to).is_ok();

        if target_exists && !replace {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target name is taken").into());
        }

        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        let result = self.sftp()?.rename(from, to, Some(flags));
        match result {
            Ok(()) => Ok(()),
            // SFTPv3 servers ignore the overwrite flag and refuse to clobber.
            Err(err) if target_exists && matches!(err.code(), ErrorCode::SFTP(_)) => {
                let sftp = self.sftp()?;
                let retried = sftp.unlink(to).and_then(|()| sftp.rename(from, to, Some(flags)));
                retried.map_err(|e| self.sftp_failure(e))
            }
            Err(err) => Err(self.sftp_failure(err)),
        }
    }

    fn remove(&mut self, path: &str) -> Result<(), ChannelError> {
        let result = self.sftp()?.unlink(Path::new(path));
        result.map_err(|err| self.sftp_failure(err))
    }

    fn close(&mut self) {
        if let Some(mut sftp) = self.sftp.take()
            && let Err(err) = sftp.shutdown()
        {
            tracing::debug!("sftp shutdown: {err}");
        }

        if self.alive {
            if let Err(err) = self.session.disconnect(None, "plugshelf disconnect", None) {
                tracing::debug!("ssh disconnect: {err}");
            }
            self.alive = false;
        }
    }
}

fn open_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::new(ConnectFailure::Network, format!("{}: {e}", endpoint.host)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) if err.kind() == io::ErrorKind::TimedOut => ConnectError::new(
            ConnectFailure::Timeout,
            format!("{}:{} did not answer within {timeout:?}", endpoint.host, endpoint.port),
        ),
        Some(err) => ConnectError::new(
            ConnectFailure::Network,
            format!("{}:{}: {err}", endpoint.host, endpoint.port),
        ),
        None => ConnectError::new(
            ConnectFailure::Network,
            format!("{} resolved to no addresses", endpoint.host),
        ),
    })
}

fn authenticate(session: &Session, endpoint: &Endpoint) -> Result<(), ConnectError> {
    let result = match &endpoint.auth {
        Auth::Password(password) => {
            session.userauth_password(&endpoint.username, password.expose_secret())
        }
        Auth::PrivateKey { path, passphrase } => session.userauth_pubkey_file(
            &endpoint.username,
            None,
            path,
            passphrase.as_ref().map(|p| p.expose_secret()),
        ),
    };

    result.map_err(|e| classify(&e, ConnectFailure::AuthRejected))?;

    if !session.authenticated() {
        return Err(ConnectError::new(
            ConnectFailure::AuthRejected,
            format!("server did not accept credentials for {}", endpoint.username),
        ));
    }

    Ok(())
}

fn classify(err: &ssh2::Error, fallback: ConnectFailure) -> ConnectError {
    let kind = if err.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        ConnectFailure::Timeout
    } else {
        fallback
    };
    ConnectError::new(kind, err.to_string())
}

fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
