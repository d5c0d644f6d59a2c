use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::store::cancel::copy_with_cancel;
use crate::store::error::{StoreError, StoreResult};
use crate::store::naming::NamingConvention;
use crate::store::{PluginEntry, check_entry_name};

const STAGING_PREFIX: &str = ".plugshelf-";
const STAGING_SUFFIX: &str = ".partial";

/// Plugin store backed by a directory on this machine.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    pub fn new(dir: PathBuf) -> StoreResult<Self> {
        if !dir.is_dir() {
            return Err(StoreError::io(
                format!("open {}", dir.display()),
                io::Error::new(io::ErrorKind::NotFound, "not a directory"),
            ));
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn list(&self, naming: &NamingConvention) -> Vec<PluginEntry> {
        let mut entries = Vec::new();

        for result in WalkBuilder::new(&self.dir)
            .max_depth(Some(1))
            .standard_filters(false)
            .hidden(false)
            .build()
        {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("listing {}: {err}", self.dir.display());
                    continue;
                }
            };

            if entry.path() == self.dir {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            entries.push(PluginEntry::new(name, naming));
        }

        entries
    }

    /// Copies `source` into the directory as `name`, replacing any existing
    /// file. The copy is staged under a temporary name and renamed into place.
    pub fn install(&self, source: &Path, name: &str, cancel: &CancellationToken) -> StoreResult<()> {
        check_entry_name(name)?;

        let metadata =
            fs::metadata(source).map_err(|e| StoreError::io(format!("read {}", source.display()), e))?;
        if !metadata.is_file() {
            return Err(StoreError::io(
                format!("read {}", source.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let mut input = fs::File::open(source)
            .map_err(|e| StoreError::io(format!("read {}", source.display()), e))?;

        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| StoreError::io(format!("stage {name}"), e))?;

        copy_staged(&mut input, &mut staged, cancel)
            .map_err(|e| transfer_error(format!("copy {name}"), e))?;

        staged
            .persist(self.dir.join(name))
            .map_err(|e| StoreError::io(format!("install {name}"), e.error))?;

        tracing::info!("installed {name} into {}", self.dir.display());
        Ok(())
    }

    pub fn uninstall(&self, name: &str) -> StoreResult<()> {
        let path = self.existing_file(name)?;
        fs::remove_file(&path).map_err(|e| StoreError::io(format!("delete {name}"), e))?;

        tracing::info!("uninstalled {name} from {}", self.dir.display());
        Ok(())
    }

    pub fn enable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        let target = naming.enabled_name(name)?;
        self.rename(name, &target)?;
        Ok(target)
    }

    pub fn disable(&self, name: &str, naming: &NamingConvention) -> StoreResult<String> {
        let target = naming.disabled_name(name)?;
        self.rename(name, &target)?;
        Ok(target)
    }

    /// Copies `name` into `dest_dir`. The copy is staged next to the
    /// destination, so exporting into the store directory itself leaves the
    /// plugin intact.
    pub fn export(
        &self,
        name: &str,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> StoreResult<PathBuf> {
        let source = self.existing_file(name)?;
        let dest = dest_dir.join(name);

        let mut input =
            fs::File::open(&source).map_err(|e| StoreError::io(format!("read {name}"), e))?;
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(dest_dir)
            .map_err(|e| StoreError::io(format!("export {name}"), e))?;

        copy_staged(&mut input, &mut staged, cancel)
            .map_err(|e| transfer_error(format!("export {name}"), e))?;
        staged
            .persist(&dest)
            .map_err(|e| StoreError::io(format!("export {name}"), e.error))?;

        tracing::info!("exported {name} to {}", dest.display());
        Ok(dest)
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = self.existing_file(from)?;
        let target = self.dir.join(to);

        if target.symlink_metadata().is_ok() {
            return Err(StoreError::io(
                format!("rename {from} to {to}"),
                io::Error::new(io::ErrorKind::AlreadyExists, "target name is taken"),
            ));
        }

        fs::rename(&source, &target)
            .map_err(|e| StoreError::io(format!("rename {from} to {to}"), e))?;

        tracing::info!("renamed {from} to {to} in {}", self.dir.display());
        Ok(())
    }

    fn existing_file(&self, name: &str) -> StoreResult<PathBuf> {
        check_entry_name(name)?;

        let path = self.dir.join(name);
        match path.symlink_metadata() {
            Ok(metadata) if !metadata.is_dir() => Ok(path),
            _ => Err(StoreError::NotFound(name.to_string())),
        }
    }
}

fn copy_staged(
    input: &mut fs::File,
    staged: &mut NamedTempFile,
    cancel: &CancellationToken,
) -> io::Result<()> {
    copy_with_cancel(input, staged.as_file_mut(), cancel)?;
    staged.as_file().sync_all()
}

fn transfer_error(context: String, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::Interrupted {
        StoreError::Cancelled
    } else {
        StoreError::io(context, err)
    }
}
