use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::msg::{Msg, StoreEvent};
use crate::store::remote::backend::describe_endpoint;
use crate::store::remote::transport::Connector;
use crate::store::remote::{Endpoint, HostKeyPolicy, RemoteSession, SshConnector, Timeouts};
use crate::store::{
    ActiveStore, ConnectionStatus, InstallSource, LocalBackend, NamingConvention, PluginStore,
    RemoteBackend, StoreError, StoreResult,
};

/// Everything besides the endpoint that a connect needs.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub known_hosts: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub timeouts: Timeouts,
}

pub type ConnectorFactory = Box<dyn Fn(&ConnectOptions) -> Box<dyn Connector> + Send>;

pub fn ssh_connectors() -> ConnectorFactory {
    Box::new(|options: &ConnectOptions| {
        Box::new(SshConnector::new(
            options.known_hosts.clone(),
            options.host_key_policy,
        )) as Box<dyn Connector>
    })
}

#[derive(Debug)]
pub enum StoreRequest {
    Refresh,
    UseLocal(PathBuf),
    Connect {
        endpoint: Endpoint,
        options: ConnectOptions,
    },
    Disconnect,
    Install(InstallSource),
    Uninstall(String),
    Enable(String),
    Disable(String),
    Export {
        name: String,
        dest_dir: PathBuf,
    },
    SetNaming(NamingConvention),
    Shutdown,
}

/// Token of the request the worker is running. Each request gets a fresh one.
type CurrentToken = Arc<Mutex<CancellationToken>>;

/// Handle to the thread that owns the active store. Requests run one at a
/// time, in the order they were sent.
pub struct StoreWorker {
    requests: Sender<StoreRequest>,
    current: CurrentToken,
    /// Parent of every request token; fires once on stop.
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StoreWorker {
    /// `timeouts` bounds downloads until a connect brings its own.
    pub fn spawn(
        events: Sender<Msg>,
        naming: NamingConvention,
        timeouts: Timeouts,
        connectors: ConnectorFactory,
    ) -> Result<Self> {
        let (requests, inbox) = mpsc::channel();
        let current = CurrentToken::default();
        let shutdown = CancellationToken::new();

        let state = WorkerState {
            active: ActiveStore::default(),
            naming,
            timeouts,
            current: Arc::clone(&current),
            shutdown: shutdown.clone(),
            events,
            watcher: None,
            connectors,
        };

        let handle = thread::Builder::new()
            .name("store-worker".into())
            .spawn(move || state.run(inbox))
            .context("failed to start store worker")?;

        Ok(Self {
            requests,
            current,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn send(&self, request: StoreRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| anyhow::anyhow!("store worker has stopped"))
    }

    /// Interrupts the transfer in progress, if any.
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        let _ = self.requests.send(StoreRequest::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("store worker panicked");
        }
    }
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerState {
    active: ActiveStore,
    naming: NamingConvention,
    timeouts: Timeouts,
    current: CurrentToken,
    shutdown: CancellationToken,
    events: Sender<Msg>,
    watcher: Option<RecommendedWatcher>,
    connectors: ConnectorFactory,
}

impl WorkerState {
    fn run(mut self, inbox: Receiver<StoreRequest>) {
        while let Ok(request) = inbox.recv() {
            if matches!(request, StoreRequest::Shutdown) {
                break;
            }

            let cancel = self.shutdown.child_token();
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();
            let refresh_only = matches!(request, StoreRequest::Refresh);

            let outcome = self.handle(request, &cancel);
            let failed = outcome.is_err();
            let delivered = match outcome {
                Ok(Some(message)) => self.emit(StoreEvent::Done(message)),
                Ok(None) => true,
                Err(err) => {
                    tracing::warn!("store request failed: {err}");
                    self.emit(StoreEvent::Failed(err))
                }
            };

            if !refresh_only {
                self.publish_listing();
            } else if failed {
                // Drop the entries listed before the failure.
                self.emit(StoreEvent::Listing(Vec::new()));
            }
            self.publish_location();

            if !delivered || !self.emit(StoreEvent::Idle) {
                break;
            }
        }

        self.watcher = None;
        self.active.clear();
        tracing::info!("store worker stopped");
    }

    fn handle(
        &mut self,
        request: StoreRequest,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<String>> {
        match request {
            StoreRequest::Refresh => {
                let entries = self.active.get()?.list(&self.naming)?;
                self.emit(StoreEvent::Listing(entries));
                Ok(None)
            }
            StoreRequest::UseLocal(dir) => {
                let local = LocalBackend::new(dir.clone())?;
                self.watch(&dir);
                self.active.select(PluginStore::Local(local));
                tracing::info!("using local store {}", dir.display());
                Ok(Some(format!("opened {}", dir.display())))
            }
            StoreRequest::Connect { endpoint, options } => {
                self.watcher = None;
                // Drop the old store first so its session closes before the new one opens.
                self.active.clear();

                let connector = (self.connectors)(&options);
                let backend = RemoteBackend::new(RemoteSession::new(connector));
                let label = endpoint.to_string();

                self.emit(StoreEvent::Location {
                    label: describe_endpoint(&endpoint),
                    status: Some(ConnectionStatus::Connecting),
                });
                self.timeouts = options.timeouts;
                let result = backend.connect(endpoint, options.timeouts);
                self.active.select(PluginStore::Remote(backend));

                result?;
                Ok(Some(format!("connected to {label}")))
            }
            StoreRequest::Disconnect => {
                let remote = self
                    .active
                    .get()?
                    .remote()
                    .ok_or(StoreError::NotConnected)?;
                remote.disconnect();
                Ok(Some("disconnected".to_string()))
            }
            StoreRequest::Install(source) => {
                let name =
                    self.active
                        .get()?
                        .install(&source, self.timeouts.operation, cancel)?;
                Ok(Some(format!("installed {name}")))
            }
            StoreRequest::Uninstall(name) => {
                self.active.get()?.uninstall(&name)?;
                Ok(Some(format!("uninstalled {name}")))
            }
            StoreRequest::Enable(name) => {
                let renamed = self.active.get()?.enable(&name, &self.naming)?;
                Ok(Some(format!("enabled {renamed}")))
            }
            StoreRequest::Disable(name) => {
                let renamed = self.active.get()?.disable(&name, &self.naming)?;
                Ok(Some(format!("disabled {renamed}")))
            }
            StoreRequest::Export { name, dest_dir } => {
                let dest = self.active.get()?.export(&name, &dest_dir, cancel)?;
                Ok(Some(format!("saved {}", dest.display())))
            }
            StoreRequest::SetNaming(naming) => {
                self.naming = naming;
                Ok(Some(format!("disabled suffix is now {}", self.naming)))
            }
            StoreRequest::Shutdown => Ok(None),
        }
    }

    /// Sends a fresh listing after a request. A store that is missing or not
    /// connected lists as empty without another error.
    fn publish_listing(&self) {
        let entries = match self.active.get() {
            Ok(store) => match store.list(&self.naming) {
                Ok(entries) => entries,
                Err(StoreError::NotConnected) => Vec::new(),
                Err(err) => {
                    self.emit(StoreEvent::Failed(err));
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        self.emit(StoreEvent::Listing(entries));
    }

    fn publish_location(&self) {
        let event = match self.active.get() {
            Ok(store) => StoreEvent::Location {
                label: store.describe(),
                status: store.remote().map(RemoteBackend::status),
            },
            Err(_) => StoreEvent::Location {
                label: String::new(),
                status: None,
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: StoreEvent) -> bool {
        self.events.send(Msg::Store(event)).is_ok()
    }

    fn watch(&mut self, dir: &Path) {
        self.watcher = None;

        let events = self.events.clone();
        let mut watcher =
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        let _ = events.send(Msg::DirectoryChanged);
                    }
                }
                Err(err) => tracing::warn!("directory watcher error: {err}"),
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    tracing::warn!("failed to initialize directory watcher: {err}");
                    return;
                }
            };

        if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            tracing::warn!("failed to watch {}: {err}", dir.display());
            return;
        }

        self.watcher = Some(watcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::remote::memory::{MemoryConnector, password_endpoint};
    use crate::store::{ConnectionStatus, EntryState};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory_connectors(connector: &MemoryConnector) -> ConnectorFactory {
        let connector = connector.clone();
        Box::new(move |_: &ConnectOptions| Box::new(connector.clone()) as Box<dyn Connector>)
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            known_hosts: PathBuf::from("/nonexistent/known_hosts"),
            host_key_policy: HostKeyPolicy::Strict,
            timeouts: Timeouts::default(),
        }
    }

    /// Collects store events up to and including the next `Idle`.
    fn until_idle(rx: &Receiver<Msg>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Msg::Store(StoreEvent::Idle) => return events,
                Msg::Store(event) => events.push(event),
                _ => {}
            }
        }
    }

    fn last_listing(events: &[StoreEvent]) -> Vec<(String, EntryState)> {
        events
            .iter()
            .rev()
            .find_map(|event| match event {
                StoreEvent::Listing(entries) => Some(
                    entries
                        .iter()
                        .map(|entry| (entry.name.clone(), entry.state))
                        .collect(),
                ),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_requests_without_store_report_not_configured() {
        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&MemoryConnector::new("secret", "/plugins")),
        )
        .unwrap();

        worker.send(StoreRequest::Enable("Economy.jar.disabled".into())).unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Failed(StoreError::NotConfigured))));
        assert!(last_listing(&events).is_empty());

        drop(worker);
    }

    #[test]
    fn test_local_disable_enable_flow() {
        let dir = tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        fs::create_dir(&plugins).unwrap();
        fs::write(plugins.join("Economy.jar"), b"jar").unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&MemoryConnector::new("secret", "/plugins")),
        )
        .unwrap();

        worker.send(StoreRequest::UseLocal(plugins.clone())).unwrap();
        let events = until_idle(&rx);
        assert_eq!(
            last_listing(&events),
            vec![("Economy.jar".to_string(), EntryState::Enabled)]
        );
        assert!(events.iter().any(|event| matches!(
            event,
            StoreEvent::Location { status: None, .. }
        )));

        worker
            .send(StoreRequest::SetNaming(NamingConvention::new(".off").unwrap()))
            .unwrap();
        until_idle(&rx);

        worker.send(StoreRequest::Disable("Economy.jar".into())).unwrap();
        let events = until_idle(&rx);
        assert_eq!(
            last_listing(&events),
            vec![("Economy.jar.off".to_string(), EntryState::Disabled)]
        );

        worker.send(StoreRequest::Enable("Economy.jar.off".into())).unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Done(message) if message == "enabled Economy.jar")));

        drop(worker);
    }

    #[test]
    fn test_remote_connect_failure_then_list() {
        let connector = MemoryConnector::new("secret", "/plugins");
        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&connector),
        )
        .unwrap();

        worker
            .send(StoreRequest::Connect {
                endpoint: password_endpoint("wrong", "/plugins"),
                options: options(),
            })
            .unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Failed(StoreError::Connection(_)))));
        assert!(events.iter().any(|event| matches!(
            event,
            StoreEvent::Location {
                status: Some(ConnectionStatus::Failed(_)),
                ..
            }
        )));

        worker.send(StoreRequest::Refresh).unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Failed(StoreError::NotConnected))));

        drop(worker);
    }

    #[test]
    fn test_remote_install_and_disconnect() {
        let connector = MemoryConnector::new("secret", "/plugins");
        let downloads = tempdir().unwrap();
        let source = downloads.path().join("Chat.jar");
        fs::write(&source, b"chat").unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&connector),
        )
        .unwrap();

        worker
            .send(StoreRequest::Connect {
                endpoint: password_endpoint("secret", "/plugins"),
                options: options(),
            })
            .unwrap();
        let events = until_idle(&rx);
        let connecting = events.iter().position(|event| {
            matches!(
                event,
                StoreEvent::Location {
                    status: Some(ConnectionStatus::Connecting),
                    ..
                }
            )
        });
        let done = events
            .iter()
            .position(|event| matches!(event, StoreEvent::Done(_)));
        assert!(connecting.unwrap() < done.unwrap());

        worker
            .send(StoreRequest::Install(InstallSource::Path(source)))
            .unwrap();
        let events = until_idle(&rx);
        assert_eq!(
            last_listing(&events),
            vec![("Chat.jar".to_string(), EntryState::Enabled)]
        );

        worker.send(StoreRequest::Disconnect).unwrap();
        let events = until_idle(&rx);
        assert!(last_listing(&events).is_empty());
        assert!(events.iter().any(|event| matches!(
            event,
            StoreEvent::Location {
                status: Some(ConnectionStatus::Disconnected),
                ..
            }
        )));
        assert!(!connector.server().channel_open);

        drop(worker);
    }

    #[test]
    fn test_shutdown_closes_remote_session() {
        let connector = MemoryConnector::new("secret", "/plugins");
        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&connector),
        )
        .unwrap();

        worker
            .send(StoreRequest::Connect {
                endpoint: password_endpoint("secret", "/plugins"),
                options: options(),
            })
            .unwrap();
        until_idle(&rx);
        assert!(connector.server().channel_open);

        drop(worker);
        assert!(!connector.server().channel_open);
        assert_eq!(connector.server().closes, 1);
    }

    #[test]
    fn test_failed_refresh_clears_listing() {
        let connector = MemoryConnector::new("secret", "/plugins");
        connector
            .server()
            .files
            .insert("/plugins/Economy.jar".into(), b"jar".to_vec());
        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&connector),
        )
        .unwrap();

        worker
            .send(StoreRequest::Connect {
                endpoint: password_endpoint("secret", "/plugins"),
                options: options(),
            })
            .unwrap();
        let events = until_idle(&rx);
        assert_eq!(
            last_listing(&events),
            vec![("Economy.jar".to_string(), EntryState::Enabled)]
        );

        connector.server().alive = false;
        worker.send(StoreRequest::Refresh).unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Failed(StoreError::NotConnected))));
        assert!(last_listing(&events).is_empty());
        assert!(events.iter().any(|event| matches!(
            event,
            StoreEvent::Location {
                status: Some(ConnectionStatus::Failed(_)),
                ..
            }
        )));

        drop(worker);
    }

    #[test]
    fn test_configured_timeout_bounds_url_install() {
        let dir = tempdir().unwrap();
        // Accepts the connection but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/Economy.jar", silent.local_addr().unwrap());

        let timeouts = Timeouts {
            connect: Duration::from_secs(10),
            operation: Duration::from_millis(300),
        };
        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            timeouts,
            memory_connectors(&MemoryConnector::new("secret", "/plugins")),
        )
        .unwrap();

        worker
            .send(StoreRequest::UseLocal(dir.path().to_path_buf()))
            .unwrap();
        until_idle(&rx);

        // The default 30s operation timeout would outlast `until_idle`.
        worker
            .send(StoreRequest::Install(InstallSource::Url(url)))
            .unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Failed(StoreError::Io { .. }))));
        assert!(last_listing(&events).is_empty());

        drop(worker);
        drop(silent);
    }

    #[test]
    fn test_cancel_while_idle_does_not_affect_next_request() {
        let dir = tempdir().unwrap();
        let downloads = tempdir().unwrap();
        let source = downloads.path().join("Economy.jar");
        fs::write(&source, b"economy").unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = StoreWorker::spawn(
            tx,
            NamingConvention::default(),
            Timeouts::default(),
            memory_connectors(&MemoryConnector::new("secret", "/plugins")),
        )
        .unwrap();

        worker
            .send(StoreRequest::UseLocal(dir.path().to_path_buf()))
            .unwrap();
        until_idle(&rx);

        worker.cancel();
        worker
            .send(StoreRequest::Install(InstallSource::Path(source)))
            .unwrap();
        let events = until_idle(&rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, StoreEvent::Done(message) if message == "installed Economy.jar")));
        assert_eq!(fs::read(dir.path().join("Economy.jar")).unwrap(), b"economy");

        drop(worker);
    }
}
