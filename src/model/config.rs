use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::NamingConvention;
use crate::store::naming::SuffixError;
use crate::store::remote::endpoint::DEFAULT_SSH_PORT;
use crate::store::remote::{Auth, Endpoint, HostKeyPolicy, RemoteTarget, Timeouts};
use crate::worker::ConnectOptions;

const DEFAULTS: &str = include_str!("../../config/default.toml");

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub naming: NamingConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    /// Where `save` writes. Unset for configs that were never loaded from disk.
    #[serde(skip)]
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub resume_last_location: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location: Option<LastLocation>,
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LastLocation {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamingConfig {
    pub disabled_suffix: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: String,
}

impl AppConfig {
    /// Load configuration with layering: defaults, then the user file merged
    /// over them table by table.
    pub fn load() -> Result<Self> {
        let path = directories::ProjectDirs::from("", "", "plugshelf")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        let user = match &path {
            Some(path) if path.exists() => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            _ => None,
        };

        let mut config = Self::from_layers(user.as_deref())?;
        config.path = path;
        Ok(config)
    }

    pub fn from_layers(user: Option<&str>) -> Result<Self> {
        let mut merged: toml::Value = toml::from_str(DEFAULTS).context("invalid built-in defaults")?;

        if let Some(user) = user {
            let overlay: toml::Value = toml::from_str(user).context("invalid user config")?;
            merge(&mut merged, overlay);
        }

        merged.try_into().context("invalid config")
    }

    #[cfg(test)]
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Writes the config back to the file it was loaded from. Staged next to
    /// the target and renamed into place.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(text.as_bytes())?;
        staged.flush()?;
        staged
            .persist(path)
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::debug!("saved config to {}", path.display());
        Ok(())
    }

    pub fn naming(&self) -> Result<NamingConvention, SuffixError> {
        NamingConvention::new(&self.naming.disabled_suffix)
    }

    pub fn set_naming(&mut self, naming: &NamingConvention) {
        self.naming.disabled_suffix = naming.suffix().to_string();
    }

    pub fn local_dir(&self) -> Option<PathBuf> {
        self.local.directory.as_deref().map(expand_home)
    }

    pub fn remember_local(&mut self, dir: &Path) {
        self.local.directory = Some(dir.display().to_string());
        self.general.last_location = Some(LastLocation::Local);
    }

    pub fn remote_target(&self) -> Option<RemoteTarget> {
        Some(RemoteTarget {
            username: self.remote.username.clone()?,
            host: self.remote.host.clone()?,
            port: Some(self.remote.port),
            path: self.remote.path.clone(),
        })
    }

    pub fn remember_remote(&mut self, target: &RemoteTarget) {
        self.remote.host = Some(target.host.clone());
        self.remote.username = Some(target.username.clone());
        self.remote.port = target.port.unwrap_or(DEFAULT_SSH_PORT);
        if let Some(path) = &target.path {
            self.remote.path = Some(path.clone());
        }
        self.general.last_location = Some(LastLocation::Remote);
    }

    /// True when connecting asks for a key passphrase rather than a password.
    pub fn uses_private_key(&self) -> bool {
        self.remote.private_key.is_some()
    }

    /// Builds the endpoint for the configured remote. `secret` is the
    /// password, or the key passphrase when a private key is configured (an
    /// empty passphrase means none).
    pub fn endpoint(&self, secret: SecretString) -> Option<Endpoint> {
        let target = self.remote_target()?;

        let auth = match self.remote.private_key.as_deref() {
            Some(key) => {
                let passphrase = (!secret.expose_secret().is_empty()).then_some(secret);
                Auth::PrivateKey {
                    path: expand_home(key),
                    passphrase,
                }
            }
            None => Auth::Password(secret),
        };

        Some(Endpoint {
            host: target.host,
            port: target.port.unwrap_or(DEFAULT_SSH_PORT),
            username: target.username,
            auth,
            path: target.path.unwrap_or_else(|| ".".to_string()),
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.remote.connect_timeout_ms),
            operation: Duration::from_millis(self.remote.operation_timeout_ms),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            known_hosts: expand_home(&self.remote.known_hosts),
            host_key_policy: self.remote.host_key_policy,
            timeouts: self.timeouts(),
        }
    }
}

/// Overlays `overlay` onto `base`. Tables merge key by key; any other value
/// replaces what was there.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~')
        && (rest.is_empty() || rest.starts_with('/'))
        && let Some(home) = dirs_home()
    {
        return home.join(rest.trim_start_matches('/'));
    }
    PathBuf::from(raw)
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_layers(None).unwrap();
        assert!(config.general.resume_last_location);
        assert_eq!(config.general.last_location, None);
        assert_eq!(config.naming().unwrap().suffix(), ".disabled");
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.timeouts(), Timeouts::default());
        assert!(config.remote_target().is_none());
    }

    #[test]
    fn test_user_file_merges_over_defaults() {
        let config = AppConfig::from_layers(Some(
            r#"
            [naming]
            disabled_suffix = "off"

            [remote]
            host = "mc.example.org"
            username = "steve"
            host_key_policy = "accept-new"
            "#,
        ))
        .unwrap();

        assert_eq!(config.naming().unwrap().suffix(), ".off");
        assert_eq!(config.remote.host.as_deref(), Some("mc.example.org"));
        assert_eq!(config.remote.host_key_policy, HostKeyPolicy::AcceptNew);
        // Untouched keys of a merged table keep their defaults.
        assert_eq!(config.remote.connect_timeout_ms, 10_000);
        assert_eq!(config.general.log_filter, "plugshelf=info");
    }

    #[test]
    fn test_invalid_suffix_is_reported() {
        let config = AppConfig::from_layers(Some("[naming]\ndisabled_suffix = \"a b\"\n")).unwrap();
        assert!(config.naming().is_err());
    }

    #[test]
    fn test_endpoint_uses_password_or_key() {
        let mut config = AppConfig::from_layers(None).unwrap();
        assert!(config.endpoint(SecretString::from("pw".to_string())).is_none());

        config.remember_remote(&RemoteTarget::parse("steve@mc.example.org:2222/srv/plugins").unwrap());
        let endpoint = config.endpoint(SecretString::from("pw".to_string())).unwrap();
        assert_eq!(endpoint.port, 2222);
        assert_eq!(endpoint.path, "/srv/plugins");
        assert!(matches!(&endpoint.auth, Auth::Password(pw) if pw.expose_secret() == "pw"));

        config.remote.private_key = Some("/keys/id_ed25519".into());
        let endpoint = config.endpoint(SecretString::from(String::new())).unwrap();
        assert!(matches!(
            &endpoint.auth,
            Auth::PrivateKey { passphrase: None, path } if path == Path::new("/keys/id_ed25519")
        ));
    }

    #[test]
    fn test_save_round_trip_without_secrets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::from_layers(None).unwrap().with_path(path.clone());
        config.remember_remote(&RemoteTarget::parse("steve@mc.example.org/srv/plugins").unwrap());
        config.set_naming(&NamingConvention::new(".off").unwrap());
        config.save().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("password"));

        let reloaded = AppConfig::from_layers(Some(&text)).unwrap();
        assert_eq!(reloaded.general.last_location, Some(LastLocation::Remote));
        assert_eq!(reloaded.remote.username.as_deref(), Some("steve"));
        assert_eq!(reloaded.naming.disabled_suffix, ".off");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/plugins"), PathBuf::from("/srv/plugins"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
        if let Some(home) = dirs_home() {
            assert_eq!(expand_home("~/plugins"), home.join("plugins"));
        }
    }
}
