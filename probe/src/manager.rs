//! Creating shadows on demand and keeping them fresh.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_comm::MessageEndpoint;
use mesh_kernel::{now_millis, NetMeshBaseIdentifier, ScheduledTask, Scheduler};
use mesh_net::{link_in_memory, NetError, NetResult, ProxyEndpointFactory, XprisoMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    coherence::CoherenceSpecification,
    error::{ProbeError, ProbeResult},
    shadow::{ProbeContext, ShadowMeshBase},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeManagerConfig {
    /// Coherence of newly created shadows.
    #[serde(default)]
    pub coherence: CoherenceSpecification,
    /// Retire a shadow nobody replicates from once it has not been needed for
    /// this long. `None` keeps shadows forever.
    #[serde(default = "default_retire_after_ms")]
    pub retire_after_ms: Option<u64>,
}

fn default_retire_after_ms() -> Option<u64> {
    Some(24 * 60 * 60 * 1000)
}

impl Default for ProbeManagerConfig {
    fn default() -> Self {
        Self {
            coherence: CoherenceSpecification::default(),
            retire_after_ms: default_retire_after_ms(),
        }
    }
}

impl ProbeManagerConfig {
    pub fn retire_after(&self) -> Option<Duration> {
        self.retire_after_ms.map(Duration::from_millis)
    }
}

pub struct ProbeManager {
    context: ProbeContext,
    config: ProbeManagerConfig,
    scheduler: Arc<dyn Scheduler>,
    shadows: DashMap<NetMeshBaseIdentifier, Arc<ShadowMeshBase>>,
    next_runs: DashMap<NetMeshBaseIdentifier, ScheduledTask>,
    creating: DashMap<NetMeshBaseIdentifier, Arc<tokio::sync::Mutex<()>>>,
    stopped: AtomicBool,
    self_ref: Weak<ProbeManager>,
}

impl ProbeManager {
    pub fn new(
        context: ProbeContext,
        config: ProbeManagerConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            context,
            config,
            scheduler,
            shadows: DashMap::new(),
            next_runs: DashMap::new(),
            creating: DashMap::new(),
            stopped: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn shadow(&self, source: &NetMeshBaseIdentifier) -> Option<Arc<ShadowMeshBase>> {
        self.shadows.get(source).map(|s| Arc::clone(s.value()))
    }

    pub fn sources(&self) -> Vec<NetMeshBaseIdentifier> {
        self.shadows.iter().map(|s| s.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shadows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadows.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether a future run of `source` is scheduled.
    pub fn is_scheduled(&self, source: &NetMeshBaseIdentifier) -> bool {
        self.next_runs
            .get(source)
            .is_some_and(|t| !t.value().is_cancelled())
    }

    /// The shadow for `source`, created and probed for the first time if
    /// needed. A shadow whose first run fails is discarded.
    pub async fn obtain(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<Arc<ShadowMeshBase>> {
        if self.is_stopped() {
            return Err(ProbeError::Stopped);
        }
        if let Some(shadow) = self.shadow(source) {
            return Ok(shadow);
        }
        let gate = Arc::clone(
            self.creating
                .entry(source.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let _creating = gate.lock().await;
        if let Some(shadow) = self.shadow(source) {
            return Ok(shadow);
        }

        let result = self.create(source).await;
        self.creating.remove(source);
        result
    }

    async fn create(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<Arc<ShadowMeshBase>> {
        let shadow = ShadowMeshBase::new(source.clone(), &self.context, self.config.coherence.clone());
        if self.context.store.is_some() {
            let restored = shadow.restore().await?;
            debug!(source = %source, restored, "Restored shadow");
        }
        let next = shadow.run_now().await?;
        self.shadows.insert(source.clone(), Arc::clone(&shadow));
        info!(source = %source, objects = shadow.mesh_base().size(), "Created shadow");
        self.schedule(source, next);
        Ok(shadow)
    }

    /// Run the probe for `source` now and reschedule it.
    pub async fn run_now(&self, source: &NetMeshBaseIdentifier) -> ProbeResult<Option<Duration>> {
        let shadow = self
            .shadow(source)
            .ok_or_else(|| ProbeError::UnknownShadow(source.clone()))?;
        let result = shadow.run_now().await;
        let next = match &result {
            Ok(next) => *next,
            Err(_) => shadow.status().delay_until_next_update,
        };
        if !self.is_stopped() && self.shadows.contains_key(source) {
            self.schedule(source, next);
        }
        result
    }

    /// Drop the shadow for `source` and tell its partners to stop replicating.
    pub fn retire(&self, source: &NetMeshBaseIdentifier) -> bool {
        if let Some((_, task)) = self.next_runs.remove(source) {
            task.cancel();
        }
        let Some((_, shadow)) = self.shadows.remove(source) else {
            return false;
        };
        shadow.net().die();
        info!(source = %source, "Retired shadow");
        true
    }

    /// Cancel all future runs. Runs already in progress complete.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let sources: Vec<_> = self.next_runs.iter().map(|t| t.key().clone()).collect();
        for source in sources {
            if let Some((_, task)) = self.next_runs.remove(&source) {
                task.cancel();
            }
        }
        info!(shadows = self.shadows.len(), "Probe manager stopped");
    }

    fn schedule(&self, source: &NetMeshBaseIdentifier, delay: Option<Duration>) {
        if let Some((_, previous)) = self.next_runs.remove(source) {
            previous.cancel();
        }
        let Some(delay) = delay else {
            debug!(source = %source, "No further runs scheduled");
            return;
        };
        if self.is_stopped() {
            return;
        }
        let manager = self.self_ref.clone();
        let target = source.clone();
        let task = self.scheduler.schedule(
            delay,
            Box::pin(async move {
                if let Some(manager) = manager.upgrade() {
                    manager.run_scheduled(target).await;
                }
            }),
        );
        self.next_runs.insert(source.clone(), task.clone());
        // stop() may have run in between
        if self.is_stopped() {
            task.cancel();
            self.next_runs.remove(source);
        }
    }

    #[instrument(skip(self), fields(source = %source))]
    async fn run_scheduled(&self, source: NetMeshBaseIdentifier) {
        if self.is_stopped() {
            return;
        }
        let Some(shadow) = self.shadow(&source) else {
            return;
        };
        if let Some(grace) = self.config.retire_after() {
            if shadow.may_be_retired(now_millis(), grace) {
                self.retire(&source);
                return;
            }
        }
        let next = match shadow.run_now().await {
            Ok(next) => next,
            Err(_) => shadow.status().delay_until_next_update,
        };
        if !self.is_stopped() && self.shadows.contains_key(&source) {
            self.schedule(&source, next);
        }
    }
}

/// Connecting to an external identifier means talking to its shadow.
#[async_trait]
impl ProxyEndpointFactory for ProbeManager {
    async fn connect(
        &self,
        local: &NetMeshBaseIdentifier,
        partner: &NetMeshBaseIdentifier,
    ) -> NetResult<Arc<dyn MessageEndpoint<XprisoMessage>>> {
        let shadow = self.obtain(partner).await.map_err(|e| NetError::Unreachable {
            partner: partner.clone(),
            reason: e.to_string(),
        })?;
        if shadow.net().is_dead() {
            return Err(NetError::Dead(partner.clone()));
        }
        let (endpoint, _control) =
            link_in_memory(local, shadow.net(), self.context.policy.retry.clone());
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: ProbeManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ProbeManagerConfig::default());
        assert_eq!(config.retire_after(), Some(Duration::from_secs(24 * 3600)));

        let config: ProbeManagerConfig = serde_json::from_str(
            r#"{"coherence": {"kind": "one_time_only"}, "retire_after_ms": null}"#,
        )
        .unwrap();
        assert_eq!(config.coherence, CoherenceSpecification::OneTimeOnly);
        assert_eq!(config.retire_after(), None);
    }
}
