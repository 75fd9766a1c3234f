//! Node configuration, loaded from YAML.
//!
//! ```yaml
//! identifier: "mesh://node-a.example.com"
//! proxy:
//!   rpc_timeout_ms: 5000
//! probes:
//!   coherence: { kind: adaptive_periodic, fallback_ms: 3600000, max_ms: 604800000, factor: 1.1 }
//!   retire_after_ms: 86400000
//! fetch:
//!   request_timeout_ms: 30000
//! sweeper:
//!   interval_ms: 60000
//!   purge_unread_after_ms: 3600000
//! ```

use std::time::Duration;

use mesh_net::ProxyPolicy;
use mesh_probe::{HttpFetcherConfig, ProbeManagerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier of the local mesh base.
    #[serde(default = "default_identifier")]
    pub identifier: String,
    #[serde(default)]
    pub proxy: ProxyPolicy,
    #[serde(default)]
    pub probes: ProbeManagerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Where shadows keep their objects between runs.
    #[serde(default)]
    pub shadow_store: StoreKind,
}

fn default_identifier() -> String {
    "mesh://localhost".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identifier: default_identifier(),
            proxy: ProxyPolicy::default(),
            probes: ProbeManagerConfig::default(),
            fetch: FetchConfig::default(),
            sweeper: SweeperConfig::default(),
            shadow_store: StoreKind::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: &str) -> NodeResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| NodeError::ConfigRead {
                path: path.to_string(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> NodeResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    None,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_initial_retry_ms")]
    pub initial_retry_ms: u64,
    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,
    /// Give up retrying a transient failure after this long.
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_initial_retry_ms() -> u64 {
    1_000
}

fn default_max_retry_ms() -> u64 {
    30_000
}

fn default_max_elapsed_ms() -> u64 {
    60_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            initial_retry_ms: default_initial_retry_ms(),
            max_retry_ms: default_max_retry_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

impl From<&FetchConfig> for HttpFetcherConfig {
    fn from(config: &FetchConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            initial_retry_interval: Duration::from_millis(config.initial_retry_ms),
            max_retry_interval: Duration::from_millis(config.max_retry_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// `None` disables sweeping.
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: Option<u64>,
    /// Purge replicas not read for this long back to forward references.
    #[serde(default)]
    pub purge_unread_after_ms: Option<u64>,
}

fn default_sweep_interval_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sweep_interval_ms(),
            purge_unread_after_ms: None,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    pub fn purge_unread_after(&self) -> Option<Duration> {
        self.purge_unread_after_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mesh_probe::CoherenceSpecification;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NodeConfig::from_yaml("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.sweeper.interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.shadow_store, StoreKind::None);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
identifier: "mesh://a.example.com"
proxy:
  rpc_timeout_ms: 250
  will_give_up_lock: false
probes:
  coherence:
    kind: periodic
    period_ms: 5000
  retire_after_ms: null
fetch:
  request_timeout_ms: 1000
sweeper:
  interval_ms: null
  purge_unread_after_ms: 10000
shadow_store: memory
"#;
        let config = NodeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.identifier, "mesh://a.example.com");
        assert_eq!(config.proxy.rpc_timeout_ms, 250);
        assert!(!config.proxy.will_give_up_lock);
        assert!(config.proxy.will_give_up_home_replica);
        assert_eq!(
            config.probes.coherence,
            CoherenceSpecification::Periodic { period_ms: 5000 }
        );
        assert_eq!(config.probes.retire_after(), None);
        assert_eq!(config.fetch.request_timeout_ms, 1000);
        assert_eq!(config.fetch.max_elapsed_ms, 60_000);
        assert_eq!(config.sweeper.interval(), None);
        assert_eq!(
            config.sweeper.purge_unread_after(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.shadow_store, StoreKind::Memory);

        let http = HttpFetcherConfig::from(&config.fetch);
        assert_eq!(http.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_store_is_rejected() {
        let err = NodeConfig::from_yaml("shadow_store: disk").unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "identifier: \"mesh://file.example.com\"").unwrap();
        let config = NodeConfig::from_file(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.identifier, "mesh://file.example.com");

        let err = NodeConfig::from_file("/nonexistent/infomesh.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ConfigRead { .. }));
    }
}
