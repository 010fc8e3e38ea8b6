//! Configuration model and loading.
//!
//! The daemon is configured from one JSON file:
//!
//! ```json
//! {
//!   "server": {
//!     "addr": ":8888",
//!     "plugins_dir": "plugins",
//!     "config_dir": "config"
//!   },
//!   "clients": [
//!     {
//!       "id": "client1",
//!       "secret": "1234567890123456",
//!       "name": "Default Client",
//!       "permissions": ["plugin:manage", "service:manage", "plugin:use"]
//!     }
//!   ]
//! }
//! ```
//!
//! Unspecified server options fall back to defaults; `addr` accepts both
//! the short `":8888"` form and a full `host:port`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Client;
use crate::crypto::CipherMode;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for this model.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration file model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server options.
    #[serde(default)]
    pub server: ServerConfig,
    /// Clients registered at startup.
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl AppConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `":8888"` or `"host:port"`.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Directory scanned for plugin metadata files at startup.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// Directory holding per-plugin `<plugin_id>.yml` config files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    /// Body cipher padding mode.
    #[serde(default)]
    pub cipher_mode: CipherMode,

    /// Maximum frame header length in bytes.
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,

    /// Maximum frame body length in bytes.
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,

    /// Read deadline for the authentication frame, in seconds.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

impl ServerConfig {
    /// Normalize the listen address: a leading `:` means all interfaces.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            plugins_dir: default_plugins_dir(),
            config_dir: default_config_dir(),
            session_ttl_secs: default_session_ttl_secs(),
            cipher_mode: CipherMode::default(),
            max_header_len: default_max_header_len(),
            max_body_len: default_max_body_len(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

fn default_addr() -> String {
    ":8888".to_string()
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

const fn default_session_ttl_secs() -> i64 {
    24 * 60 * 60
}

const fn default_max_header_len() -> usize {
    64 * 1024
}

const fn default_max_body_len() -> usize {
    8 * 1024 * 1024
}

const fn default_auth_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::auth::Permission;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.addr, ":8888");
        assert_eq!(config.server.session_ttl_secs, 86400);
        assert_eq!(config.server.max_body_len, 8 * 1024 * 1024);
        assert_eq!(config.server.cipher_mode, CipherMode::Legacy);
        assert!(config.clients.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"{
            "server": {
                "addr": "127.0.0.1:9999",
                "plugins_dir": "/srv/plugins",
                "config_dir": "/srv/config",
                "session_ttl_secs": 600,
                "cipher_mode": "length-prefixed"
            },
            "clients": [
                {
                    "id": "c1",
                    "secret": "k",
                    "name": "one",
                    "permissions": ["plugin:use", "plugin:echo:use"]
                }
            ]
        }"#;

        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:9999");
        assert_eq!(config.server.session_ttl_secs, 600);
        assert_eq!(config.server.cipher_mode, CipherMode::LengthPrefixed);
        assert_eq!(config.clients.len(), 1);
        assert_eq!(
            config.clients[0].permissions,
            vec![
                Permission::PluginUse,
                Permission::PluginScoped("echo".to_string())
            ]
        );
    }

    #[test]
    fn unknown_permission_fails_parse() {
        let raw = r#"{"clients": [{"id": "c", "secret": "k", "name": "c", "permissions": ["root"]}]}"#;
        assert!(serde_json::from_str::<AppConfig>(raw).is_err());
    }

    #[test]
    fn listen_addr_normalizes_short_form() {
        let mut server = ServerConfig::default();
        assert_eq!(server.listen_addr(), "0.0.0.0:8888");
        server.addr = "127.0.0.1:8888".to_string();
        assert_eq!(server.listen_addr(), "127.0.0.1:8888");
    }

    #[test]
    fn from_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"addr": ":7001"}}, "clients": []}}"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.addr, ":7001");

        assert!(matches!(
            AppConfig::from_file("/nonexistent/config.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
