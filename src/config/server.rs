use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_BLOB_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    /// Smart HTTP listener port.
    pub port: u16,
    /// SSH listener port. `0` disables the SSH transport.
    pub ssh_port: u16,
    pub data_dir: PathBuf,
    pub indexer: IndexerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    /// Wait between a push finishing and reading the after-snapshot.
    pub settle_delay_ms: u64,
    /// Blobs larger than this are recorded without content.
    pub max_blob_size: u64,
    /// Rows per multi-row insert. Capped at 500.
    pub batch_size: usize,
}

impl ServerConfig {
    /// Reads a TOML config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexer.batch_size == 0 || self.indexer.batch_size > DEFAULT_BATCH_SIZE {
            return Err(Error::Config(format!(
                "indexer.batch_size must be between 1 and {DEFAULT_BATCH_SIZE}"
            )));
        }
        if self.ssh_port != 0 && self.ssh_port == self.port {
            return Err(Error::Config(
                "ssh_port and port must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn ssh_socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.ssh_port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gitgate.db")
    }

    #[must_use]
    pub fn host_key_path(&self) -> PathBuf {
        self.data_dir.join("ssh_host_ed25519_key")
    }

    #[must_use]
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ssh_port: 2222,
            data_dir: PathBuf::from("./data"),
            indexer: IndexerConfig::default(),
        }
    }
}

impl IndexerConfig {
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = 9000\n\n[indexer]\nsettle_delay_ms = 10").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.indexer.settle_delay(), Duration::from_millis(10));
        assert_eq!(config.indexer.max_blob_size, DEFAULT_MAX_BLOB_SIZE);
        assert_eq!(config.indexer.batch_size, 500);
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[indexer]\nbatch_size = 501").unwrap();
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "hostname = \"x\"").unwrap();
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_paths() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/srv/git"),
            ..ServerConfig::default()
        };
        assert_eq!(config.db_path(), Path::new("/srv/git/gitgate.db"));
        assert_eq!(config.repos_dir(), Path::new("/srv/git/repos"));
    }
}
