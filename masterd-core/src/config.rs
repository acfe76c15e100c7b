//! Master-server configuration. Parses a TOML file into a strongly-typed
//! structure. Loading is synchronous and happens once at startup; there is
//! no hot-reload (unlike the teacher's `nyx-core::config`, which watches its
//! file with `notify` — this daemon has no runtime-tunable knobs worth
//! reloading, so that complexity is not carried over).

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Default heartbeat timeout, in seconds, before a registered server is
/// dropped for going silent.
pub const DEFAULT_SERVER_TIMEOUT: u64 = 240;

/// Default age, in seconds, after which cached metadata is considered stale
/// and a re-query is forced on the next ADD.
pub const DEFAULT_METADATA_REFRESH_TIME: u64 = 60 * 5;

/// Canonical public port used by game clients.
pub const DEFAULT_PORT: u16 = 2342;

/// A bind address as read from configuration: `host` of `None` means
/// "bind to 0.0.0.0" (the unspecified address).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BindAddr {
    pub host: Option<String>,
    pub port: u16,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public registration/query socket. Always present in practice; the
    /// type allows `None` only to mirror the source's permissive loader.
    pub server_address: Option<BindAddr>,

    /// Independent verification socket. When absent, verification (and
    /// therefore all registration) is disabled per spec.md §6.
    pub query_address: Option<BindAddr>,

    /// Shell-glob patterns (`host:port`) of sources to reject outright.
    pub block_addresses: Vec<String>,

    /// Log file path, opened in append mode and flushed per line.
    pub log_file: Option<String>,

    #[serde(rename = "server_timeout")]
    pub server_timeout_secs: u64,

    #[serde(rename = "metadata_refresh_time")]
    pub metadata_refresh_time_secs: u64,

    /// Opaque signing key material (hex-encoded ed25519 seed). `None`
    /// disables the SIGN_START/SIGN_END handlers entirely.
    pub signing_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: Some(BindAddr {
                host: None,
                port: DEFAULT_PORT,
            }),
            query_address: None,
            block_addresses: Vec::new(),
            log_file: None,
            server_timeout_secs: DEFAULT_SERVER_TIMEOUT,
            metadata_refresh_time_secs: DEFAULT_METADATA_REFRESH_TIME,
            signing_key: None,
        }
    }
}

impl Config {
    /// Load and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(Error::Io)?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn server_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.server_timeout_secs)
    }

    pub fn metadata_refresh_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.metadata_refresh_time_secs)
    }
}
