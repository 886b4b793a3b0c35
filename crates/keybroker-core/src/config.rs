//! Broker configuration file parser (`keybroker.toml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::Catalog;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: ListenConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub catalog: Catalog,
}

/// HTTP listener and the basic-auth credentials the platform presents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Hosts advertised to bound applications.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Port advertised to bound applications.
    #[serde(default = "default_store_port")]
    pub port: u16,
    /// Upper bound on a single store call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub replication_factor: Option<u32>,
}

/// Where bound applications connect. Identical for every binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEndpoint {
    pub nodes: Vec<String>,
    pub port: u16,
}

fn default_listen_port() -> u16 {
    80
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/keybroker")
}

fn default_store_port() -> u16 {
    9042
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            nodes: Vec::new(),
            port: default_store_port(),
            timeout_secs: default_timeout_secs(),
            replication_factor: None,
        }
    }
}

impl StoreConfig {
    /// Path of the store file inside `data_dir`.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("keybroker.redb")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Explicit setting, else 3 for a multi-node cluster and 1 for a single node.
    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
            .unwrap_or(if self.nodes.len() > 1 { 3 } else { 1 })
    }

    pub fn endpoint(&self) -> ConnectionEndpoint {
        ConnectionEndpoint {
            nodes: self.nodes.clone(),
            port: self.port,
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BrokerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject configurations the broker cannot serve with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.username.is_empty() || self.broker.password.is_empty() {
            anyhow::bail!("broker.username and broker.password must both be set");
        }
        if self.store.nodes.is_empty() {
            anyhow::bail!("store.nodes must list at least one host");
        }
        if self.store.timeout_secs == 0 {
            anyhow::bail!("store.timeout_secs must be greater than zero");
        }
        if self.store.replication_factor == Some(0) {
            anyhow::bail!("store.replication_factor must be greater than zero");
        }
        let problems = self.catalog.problems();
        if !problems.is_empty() {
            anyhow::bail!("invalid catalog: {}", problems.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_file() {
        let config: BrokerConfig = toml::from_str("").unwrap();
        assert_eq!(config.broker.port, 80);
        assert_eq!(config.store.port, 9042);
        assert_eq!(config.store.timeout(), Duration::from_secs(60));
        assert_eq!(
            config.store.db_path(),
            PathBuf::from("/var/lib/keybroker/keybroker.redb")
        );
        assert!(config.catalog.services.is_empty());
    }

    #[test]
    fn parses_broker_and_store_sections() {
        let config: BrokerConfig = toml::from_str(
            r#"
[broker]
port = 8080
username = "user"
password = "secret"

[store]
data_dir = "/tmp/kb"
nodes = ["10.0.0.1", "10.0.0.2"]
port = 123
timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.broker.port, 8080);
        assert_eq!(config.broker.username, "user");
        assert_eq!(config.broker.password, "secret");
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/kb"));
        assert_eq!(
            config.store.endpoint(),
            ConnectionEndpoint {
                nodes: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                port: 123,
            }
        );
        assert_eq!(config.store.timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn replication_factor_follows_cluster_size() {
        let mut store = StoreConfig {
            nodes: vec!["127.0.0.1".to_string()],
            ..StoreConfig::default()
        };
        assert_eq!(store.replication_factor(), 1);

        store.nodes.push("127.0.0.2".to_string());
        assert_eq!(store.replication_factor(), 3);

        store.replication_factor = Some(2);
        assert_eq!(store.replication_factor(), 2);
    }

    #[test]
    fn validate_requires_credentials_and_nodes() {
        let mut config: BrokerConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_err());

        config.broker.username = "user".to_string();
        config.broker.password = "secret".to_string();
        assert!(config.validate().is_err());

        config.store.nodes = vec!["127.0.0.1".to_string()];
        config.validate().unwrap();

        config.store.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keybroker.toml");
        std::fs::write(
            &path,
            "[broker]\nusername = \"u\"\npassword = \"p\"\n[store]\nnodes = [\"n1\"]\n",
        )
        .unwrap();

        let config = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(config.store.nodes, vec!["n1"]);
        config.validate().unwrap();
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(BrokerConfig::from_file(Path::new("/nonexistent/keybroker.toml")).is_err());
    }
}
