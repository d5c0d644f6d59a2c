use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SSH_PORT: u16 = 22;

static TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<user>[^@\s/]+)@(?P<host>\[[^\]]+\]|[^:/\s]+)(?::(?P<port>\d+))?(?P<path>/\S*)?$")
        .expect("valid remote target regex")
});

#[derive(Debug, Clone)]
pub enum Auth {
    Password(SecretString),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

/// How the remote host's identity is checked against `known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Unknown and mismatched keys are rejected.
    #[default]
    Strict,
    /// Unknown keys are recorded on first connect; mismatches are rejected.
    AcceptNew,
    /// No verification at all.
    Insecure,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
    /// Directory holding the plugins on the remote host.
    pub path: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "{}", self.path)
    }
}

/// `user@host[:port][/path]` as typed in the command palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub username: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl RemoteTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = TARGET_RE.captures(raw.trim())?;

        let port = match caps.name("port") {
            Some(port) => Some(port.as_str().parse::<u16>().ok()?),
            None => None,
        };

        Some(Self {
            username: caps["user"].to_string(),
            host: caps["host"]
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            port,
            path: caps.name("path").map(|p| p.as_str().to_string()),
        })
    }
}
