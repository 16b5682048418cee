//! Configuration management for the media sync server

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::sync::{ParseError, PeerTarget, SyncMode};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Blob store root directory
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Accept `?file=` uploads that read from the server's filesystem
    pub allow_local_paths: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    pub mode: SyncMode,
    pub host: String,
    pub port: u16,
    pub advertise_port: Option<u16>,
    /// Peers to announce to at startup
    pub peers: Vec<PeerTarget>,
    pub timeout_secs: u64,
}

/// Malformed environment values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{var}: {source}")]
    Sync {
        var: &'static str,
        #[source]
        source: ParseError,
    },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            storage: StorageConfig {
                root: PathBuf::from("./media"),
            },
            media: MediaConfig {
                allow_local_paths: false,
            },
            sync: SyncConfig {
                name: "media-sync".to_string(),
                mode: SyncMode::Manual,
                host: "0.0.0.0".to_string(),
                port: 5001,
                advertise_port: None,
                peers: Vec::new(),
                timeout_secs: 10,
            },
        }
    }
}

impl Config {
    /// Build from process environment, falling back to defaults for unset vars
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let sync_mode = match var("SYNC_MODE") {
            Some(raw) => raw.parse().map_err(|source| ConfigError::Sync {
                var: "SYNC_MODE",
                source,
            })?,
            None => defaults.sync.mode,
        };

        let peers = match var("SYNC_PEERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse().map_err(|source| ConfigError::Sync {
                        var: "SYNC_PEERS",
                        source,
                    })
                })
                .collect::<Result<Vec<PeerTarget>, _>>()?,
            None => Vec::new(),
        };

        Ok(Config {
            server: ServerConfig {
                host: var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_or("SERVER_PORT", var("SERVER_PORT"), defaults.server.port, "a port number")?,
            },
            storage: StorageConfig {
                root: var("MEDIA_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
            },
            media: MediaConfig {
                allow_local_paths: parse_bool(
                    "MEDIA_ALLOW_LOCAL_PATHS",
                    var("MEDIA_ALLOW_LOCAL_PATHS"),
                    defaults.media.allow_local_paths,
                )?,
            },
            sync: SyncConfig {
                name: var("SYNC_NAME").unwrap_or(defaults.sync.name),
                mode: sync_mode,
                host: var("SYNC_HOST").unwrap_or(defaults.sync.host),
                port: parse_or("SYNC_PORT", var("SYNC_PORT"), defaults.sync.port, "a port number")?,
                advertise_port: match var("SYNC_ADVERTISE_PORT") {
                    Some(raw) => Some(parse_or("SYNC_ADVERTISE_PORT", Some(raw), 0, "a port number")?),
                    None => None,
                },
                peers,
                timeout_secs: parse_or(
                    "SYNC_TIMEOUT_SECS",
                    var("SYNC_TIMEOUT_SECS"),
                    defaults.sync.timeout_secs,
                    "a number of seconds",
                )?,
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            expected,
        }),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                expected: "true or false",
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.root, PathBuf::from("./media"));
        assert!(!config.media.allow_local_paths);
        assert_eq!(config.sync.mode, SyncMode::Manual);
        assert_eq!(config.sync.port, 5001);
        assert_eq!(config.sync.advertise_port, None);
        assert!(config.sync.peers.is_empty());
    }

    #[test]
    fn test_reads_sync_settings() {
        let config = config_from(&[
            ("SYNC_MODE", "push"),
            ("SYNC_NAME", "test1"),
            ("SYNC_PEERS", "test2@10.0.0.2:5001, 10.0.0.3:5001"),
            ("SYNC_ADVERTISE_PORT", "6001"),
            ("MEDIA_ALLOW_LOCAL_PATHS", "true"),
            ("MEDIA_ROOT", "/var/lib/media"),
        ])
        .unwrap();

        assert_eq!(config.sync.mode, SyncMode::Push);
        assert_eq!(config.sync.name, "test1");
        assert_eq!(config.sync.peers.len(), 2);
        assert_eq!(config.sync.peers[0].name.as_deref(), Some("test2"));
        assert_eq!(config.sync.peers[1].address(), "10.0.0.3:5001");
        assert_eq!(config.sync.advertise_port, Some(6001));
        assert!(config.media.allow_local_paths);
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/media"));
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(matches!(
            config_from(&[("SERVER_PORT", "eighty")]),
            Err(ConfigError::Invalid { var: "SERVER_PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("SYNC_MODE", "sideways")]),
            Err(ConfigError::Sync { var: "SYNC_MODE", .. })
        ));
        assert!(matches!(
            config_from(&[("SYNC_PEERS", "nohost")]),
            Err(ConfigError::Sync { var: "SYNC_PEERS", .. })
        ));
        assert!(config_from(&[("MEDIA_ALLOW_LOCAL_PATHS", "maybe")]).is_err());
    }
}
