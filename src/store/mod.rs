pub mod cancel;
pub mod error;
pub mod fetch;
pub mod local;
pub mod naming;
pub mod remote;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use error::{StoreError, StoreResult};
pub use local::LocalBackend;
pub use naming::{EntryState, NamingConvention};
pub use remote::{ConnectionStatus, RemoteBackend};

/// One file in a store listing. Built fresh on every `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEntry {
    pub name: String,
    pub state: EntryState,
}

impl PluginEntry {
    pub fn new(name: &str, naming: &NamingConvention) -> Self {
        Self {
            name: name.to_string(),
            state: naming.classify(name),
        }
    }
}

/// Where an install reads the plugin from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Path(PathBuf),
    Url(String),
}

impl InstallSource {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            InstallSource::Url(raw.to_string())
        } else {
            InstallSource::Path(PathBuf::from(raw))
        }
    }

    /// Name the plugin gets in the store.
    pub fn file_name(&self) -> StoreResult<String> {
        match self {
            InstallSource::Path(path) => path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| StoreError::InvalidSource(path.display().to_string())),
            InstallSource::Url(url) => fetch::file_name_from_url(url),
        }
    }
}

/// Entry names are bare file names inside the store directory.
pub(crate) fn check_entry_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StoreError::NotFound(name.to_string()));
    }
    Ok(())
}

/// A plugin location: a local directory or a directory on an SFTP host.
pub enum PluginStore {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl PluginStore {
    pub fn describe(&self) -> String {
        match self {
            PluginStore::Local(local) => local.dir().display().to_string(),
            PluginStore::Remote(remote) => remote.describe(),
        }
    }

    pub fn list(&self, naming: &NamingConvention) -> StoreResult<Vec<PluginEntry>> {
        match self {
            PluginStore::Local(local) => Ok(local.list(naming)),
            PluginStore::Remote(remote) => remote.list(naming),
        }
    }

    /// Installs `source` and returns the name it was stored under. URL sources
    /// are downloaded to a temporary file first, which is removed on return.
    pub fn install(
        &self,
        source: &InstallSource,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StoreResult<String> {
        let name = source.file_name()?;

        match source {
            InstallSource::Path(path) => self.install_file(path, &name, cancel)?,
            InstallSource::Url(url) => {
                if let PluginStore::Remote(remote) = self
                    && !matches!(remote.status(), ConnectionStatus::Connected)
                {
                    return Err(StoreError::NotConnected);
                }

                let staged = fetch::download(url, timeout, cancel)?;
                self.install_file(staged.path(), &name, cancel)?;
            }
        }

        Ok(name)
    }

    fn install_file(&self, path: &Path, name: &str, cancel: &CancellationToken) -> StoreResult<()> {
        match self {
            PluginStore::Local(local) => local.install(path, name, cancel),
            PluginStore::Remote(remote) => remote.install(path, name, cancel),
        }
    }

    pub fn uninstall(&self, name: &str) -> StoreResult<()> {
        match self {
            PluginStore::Local(local) => local.uninstall(name),
            PluginStore::Remote(remote) => remote.uninstall(name),
        }
    }

    pub fn enable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        match self {
            PluginStore::Local(local) => local.enable(name, naming),
            PluginStore::Remote(remote) => remote.enable(name, naming),
        }
    }

    pub fn disable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        match self {
            PluginStore::Local(local) => local.disable(name, naming),
            PluginStore::Remote(remote) => remote.disable(name, naming),
        }
    }

    /// Copies `name` out of the store into `dest_dir`.
    pub fn export(
        &self,
        name: &str,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> StoreResult<PathBuf> {
        match self {
            PluginStore::Local(local) => local.export(name, dest_dir, cancel),
            PluginStore::Remote(remote) => remote.export(name, dest_dir, cancel),
        }
    }

    pub fn remote(&self) -> Option<&RemoteBackend> {
        match self {
            PluginStore::Remote(remote) => Some(remote),
            PluginStore::Local(_) => None,
        }
    }
}

/// Holds at most one store. Replacing it drops the previous backend, which
/// closes any remote session it owned.
#[derive(Default)]
pub struct ActiveStore {
    store: Option<PluginStore>,
}

impl ActiveStore {
    pub fn select(&mut self, store: PluginStore) {
        self.store = Some(store);
    }

    pub fn clear(&mut self) {
        self.store = None;
    }

    pub fn get(&self) -> StoreResult<&PluginStore> {
        self.store.as_ref().ok_or(StoreError::NotConfigured)
    }
}
