use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::store::error::{StoreError, StoreResult};
use crate::store::naming::NamingConvention;
use crate::store::remote::endpoint::Endpoint;
use crate::store::remote::session::{ConnectionStatus, RemoteSession};
use crate::store::remote::transport::{Timeouts, join_remote};
use crate::store::{PluginEntry, check_entry_name};

struct RemoteState {
    session: RemoteSession,
    dir: String,
}

/// Plugin store on a remote host. All primitives go through one mutex, so a
/// session never has two operations in flight.
pub struct RemoteBackend {
    state: Mutex<RemoteState>,
}

impl RemoteBackend {
    pub fn new(session: RemoteSession) -> Self {
        let dir = session
            .endpoint()
            .map(|endpoint| endpoint.path.clone())
            .unwrap_or_default();

        Self {
            state: Mutex::new(RemoteState { session, dir }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, endpoint: Endpoint, timeouts: Timeouts) -> StoreResult<()> {
        let mut state = self.lock();
        state.dir = endpoint.path.clone();
        state.session.connect(endpoint, timeouts)
    }

    pub fn disconnect(&self) {
        self.lock().session.disconnect();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().session.status().clone()
    }

    pub fn describe(&self) -> String {
        let state = self.lock();
        match state.session.endpoint() {
            Some(endpoint) => describe_endpoint(endpoint),
            None => "sftp (no endpoint)".to_string(),
        }
    }

    pub fn list(&self, naming: &NamingConvention) -> StoreResult<Vec<PluginEntry>> {
        let mut state = self.lock();
        state.session.ensure_connected()?;

        let dir = state.dir.clone();
        match state.session.list_remote(&dir) {
            Ok(names) => Ok(names
                .into_iter()
                .filter(|name| name != "." && name != "..")
                .map(|name| PluginEntry::new(&name, naming))
                .collect()),
            Err(err @ (StoreError::NotFound(_) | StoreError::Io { .. }))
                if state.session.is_connected() =>
            {
                tracing::warn!("listing {dir}: {err}");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Uploads under a temporary name, then renames into place so a failed
    /// transfer never leaves a truncated file under the final name.
    pub fn install(&self, source: &Path, name: &str, cancel: &CancellationToken) -> StoreResult<()> {
        let mut state = self.lock();
        state.session.ensure_connected()?;
        check_entry_name(name)?;

        let dir = state.dir.clone();
        let staged = staging_name(name);

        let result = state
            .session
            .upload(source, &dir, &staged, cancel)
            .and_then(|_| state.session.replace(&dir, &staged, name));

        if let Err(err) = result {
            discard_staged(&mut state.session, &dir, &staged);
            return Err(err);
        }

        tracing::info!("installed {name} into {dir}");
        Ok(())
    }

    pub fn uninstall(&self, name: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.session.ensure_connected()?;
        check_entry_name(name)?;

        let dir = state.dir.clone();
        state.session.delete(&dir, name)?;
        tracing::info!("uninstalled {name} from {dir}");
        Ok(())
    }

    pub fn enable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        let mut state = self.lock();
        state.session.ensure_connected()?;
        check_entry_name(name)?;

        let target = naming.enabled_name(name)?;
        let dir = state.dir.clone();
        state.session.rename(&dir, name, &target)?;
        tracing::info!("renamed {name} to {target} in {dir}");
        Ok(target)
    }

    pub fn disable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        let mut state = self.lock();
        state.session.ensure_connected()?;
        check_entry_name(name)?;

        let target = naming.disabled_name(name)?;
        let dir = state.dir.clone();
        state.session.rename(&dir, name, &target)?;
        tracing::info!("renamed {name} to {target} in {dir}");
        Ok(target)
    }

    /// Downloads a copy of `name` into `dest_dir`.
    pub fn export(
        &self,
        name: &str,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> StoreResult<PathBuf> {
        let mut state = self.lock();
        state.session.ensure_connected()?;
        check_entry_name(name)?;

        let remote_path = join_remote(&state.dir, name);
        let dest = dest_dir.join(name);
        state.session.download(&remote_path, &dest, cancel)?;
        Ok(dest)
    }
}

/// Location label for a remote store.
pub fn describe_endpoint(endpoint: &Endpoint) -> String {
    format!("sftp://{endpoint}")
}

fn staging_name(name: &str) -> String {
    format!(".{name}.partial")
}

fn discard_staged(session: &mut RemoteSession, dir: &str, staged: &str) {
    if !session.is_connected() {
        return;
    }

    match session.delete(dir, staged) {
        Ok(()) | Err(StoreError::NotFound(_)) => {}
        Err(err) => tracing::warn!("could not remove staged upload {staged}: {err}"),
    }
}
