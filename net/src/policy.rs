//! Per-mesh-base replication policy.

use std::time::Duration;

use mesh_comm::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyPolicy {
    /// How long a proxy waits for the partner to answer a request.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Default for newly replicated objects: hand the lock to a partner that asks.
    #[serde(default = "default_true")]
    pub will_give_up_lock: bool,
    /// Default for newly replicated objects: hand the home replica to a partner that asks.
    #[serde(default = "default_true")]
    pub will_give_up_home_replica: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            will_give_up_lock: true,
            will_give_up_home_replica: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProxyPolicy {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
