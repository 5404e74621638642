//! Load node config from file and environment; command-line flags are applied on top by `main`.

use blockshare_core::protocol::BLOCK_INDEX_LEN;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Node configuration. File: ~/.config/blockshare/config.toml or /etc/blockshare/config.toml.
/// Env overrides: BLOCKSHARE_LISTEN_PORT, BLOCKSHARE_DOWNLOAD_ROOT, BLOCKSHARE_POLL_INTERVAL_SECS, BLOCKSHARE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 5000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Statically configured neighbors, `host:port`.
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
    /// Local metadata file; when set this node is the source of that file.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Where downloaded blocks and the assembled file are staged (default `downloads`).
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,
    /// Output roots for `create-meta`.
    #[serde(default = "default_blocks_root")]
    pub blocks_root: PathBuf,
    #[serde(default = "default_metadata_root")]
    pub metadata_root: PathBuf,
    /// Delay before the first neighbor pass, so neighbors can start listening.
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// Pause between full passes over the neighbor list.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Bound on connect and on each request/response exchange.
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Inbound handlers allowed to run at once.
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,
    /// Largest frame payload this node will buffer.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u32,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    5000
}
fn default_download_root() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_blocks_root() -> PathBuf {
    PathBuf::from("blocks")
}
fn default_metadata_root() -> PathBuf {
    PathBuf::from("metadata")
}
fn default_startup_delay_secs() -> u64 {
    2
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_max_inbound_connections() -> usize {
    64
}
fn default_max_payload_bytes() -> u32 {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            neighbors: Vec::new(),
            metadata_path: None,
            download_root: default_download_root(),
            blocks_root: default_blocks_root(),
            metadata_root: default_metadata_root(),
            startup_delay_secs: default_startup_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            max_inbound_connections: default_max_inbound_connections(),
            max_payload_bytes: default_max_payload_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive"));
        }
        if self.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid("io_timeout_secs must be positive"));
        }
        if self.max_inbound_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_inbound_connections must be positive",
            ));
        }
        if self.max_payload_bytes < 4 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must leave room for a block index",
            ));
        }
        Ok(())
    }

    /// A block must fit one BLOCK_DATA payload under `max_payload_bytes`, or no peer using
    /// these settings could ever download it.
    pub fn check_block_size(&self, block_size: u32) -> Result<(), ConfigError> {
        let frame = u64::from(block_size) + BLOCK_INDEX_LEN as u64;
        if frame > u64::from(self.max_payload_bytes) {
            return Err(ConfigError::BlockTooLarge {
                block_size,
                max_payload: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(p) = get("BLOCKSHARE_LISTEN_PORT").and_then(|s| s.parse().ok()) {
            self.listen_port = p;
        }
        if let Some(dir) = get("BLOCKSHARE_DOWNLOAD_ROOT") {
            self.download_root = PathBuf::from(dir);
        }
        if let Some(secs) = get("BLOCKSHARE_POLL_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.poll_interval_secs = secs;
        }
        if let Some(level) = get("BLOCKSHARE_LOG") {
            self.log_level = level;
        }
    }
}

/// Load config: defaults, then the config file (explicit path or the first standard location
/// present), then env vars. An explicit path that cannot be read or parsed is an error.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/blockshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/blockshare/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// A neighbor endpoint. Host may be an IP address or a resolvable name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Neighbor {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Neighbor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadNeighbor(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Neighbor {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("neighbor {0:?} is not host:port")]
    BadNeighbor(String),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("block size {block_size} does not fit a {max_payload}-byte payload with its index")]
    BlockTooLarge { block_size: u32, max_payload: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.poll_interval(), Duration::from_secs(5));
        assert_eq!(c.startup_delay(), Duration::from_secs(2));
    }

    #[test]
    fn parse_file_with_neighbors() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 6001
            neighbors = ["127.0.0.1:6002", "peer.local:6003", "[::1]:6004"]
            metadata_path = "metadata/a.txt.meta"
            max_inbound_connections = 8
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 6001);
        assert_eq!(c.neighbors.len(), 3);
        assert_eq!(c.neighbors[1].host, "peer.local");
        assert_eq!(c.neighbors[2].host, "::1");
        assert_eq!(c.neighbors[2].to_string(), "[::1]:6004");
        assert_eq!(c.max_inbound_connections, 8);
        assert_eq!(c.download_root, PathBuf::from("downloads"));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn bad_neighbor_rejected() {
        assert!("localhost".parse::<Neighbor>().is_err());
        assert!(":5000".parse::<Neighbor>().is_err());
        assert!("host:notaport".parse::<Neighbor>().is_err());
        assert!(toml::from_str::<Config>(r#"neighbors = ["x"]"#).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("BLOCKSHARE_LISTEN_PORT", "7000"),
            ("BLOCKSHARE_DOWNLOAD_ROOT", "/tmp/dl"),
            ("BLOCKSHARE_POLL_INTERVAL_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 7000);
        assert_eq!(c.download_root, PathBuf::from("/tmp/dl"));
        assert_eq!(c.poll_interval_secs, 5);
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(r, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn block_size_must_fit_payload_limit() {
        let c = Config {
            max_payload_bytes: 1028,
            ..Config::default()
        };
        c.check_block_size(1024).unwrap();
        assert!(matches!(
            c.check_block_size(1025),
            Err(ConfigError::BlockTooLarge {
                block_size: 1025,
                max_payload: 1028
            })
        ));
        Config::default().check_block_size(1024 * 1024).unwrap();
    }

    #[test]
    fn invalid_values_rejected() {
        let mut c = Config::default();
        c.max_inbound_connections = 0;
        assert!(c.validate().is_err());
        let mut c = Config::default();
        c.poll_interval_secs = 0;
        assert!(c.validate().is_err());
    }
}
