//! Wiring a local mesh base, its shadows and its sweeper into one node.

use std::{sync::Arc, time::Duration};

use mesh_kernel::{
    DefaultSweepPolicy, MeshObject, MeshObjectIdentifier, MemoryStore, MeshBase, ModelBase,
    NetMeshBaseIdentifier, Scheduler, Store, SweepReport, Sweeper, TokioScheduler, TypeIdentifier,
};
use mesh_net::{MemoryMeshNetwork, NetMeshBase};
use mesh_probe::{
    probe_model, ContentFetcher, HttpFetcherConfig, ProbeContext, ProbeDirectory, ProbeManager,
    SchemeFetcher,
};
use tracing::info;

use crate::{
    config::{NodeConfig, StoreKind},
    error::NodeResult,
};

pub struct Node {
    net: Arc<NetMeshBase>,
    network: Arc<MemoryMeshNetwork>,
    probes: Arc<ProbeManager>,
    sweeper: Option<Arc<Sweeper>>,
}

impl Node {
    /// Start a node fetching over HTTP(S) and from local files. Must be
    /// called within a tokio runtime.
    pub fn start(config: &NodeConfig) -> NodeResult<Self> {
        let fetcher = SchemeFetcher::with_defaults(HttpFetcherConfig::from(&config.fetch))?;
        Self::start_with_fetcher(config, Arc::new(fetcher))
    }

    pub fn start_with_fetcher(
        config: &NodeConfig,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> NodeResult<Self> {
        let identifier = NetMeshBaseIdentifier::from_external_form(&config.identifier)?;
        let model: Arc<ModelBase> = Arc::new(probe_model());
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());

        let base = MeshBase::builder(identifier.clone(), Arc::clone(&model)).build();
        let net = NetMeshBase::new(Arc::clone(&base), config.proxy.clone());
        let network = MemoryMeshNetwork::new(config.proxy.retry.clone());
        network.register(&net);

        let store: Option<Arc<dyn Store>> = match config.shadow_store {
            StoreKind::None => None,
            StoreKind::Memory => Some(Arc::new(MemoryStore::new())),
        };
        let context = ProbeContext {
            model,
            fetcher,
            directory: Arc::new(ProbeDirectory::with_defaults()),
            store,
            policy: config.proxy.clone(),
        };
        let probes = ProbeManager::new(context, config.probes.clone(), Arc::clone(&scheduler));
        network.set_fallback(probes.clone());

        let sweeper = config.sweeper.interval().map(|interval| {
            let policy = DefaultSweepPolicy {
                purge_unread_after: config.sweeper.purge_unread_after(),
            };
            let sweeper = Arc::new(
                Sweeper::new(base, Arc::new(policy), scheduler, interval)
                    .with_purger(net.clone()),
            );
            sweeper.start();
            sweeper
        });

        info!(
            identifier = %identifier,
            sweeping = sweeper.is_some(),
            coherence = %config.probes.coherence,
            "Node started"
        );
        Ok(Self {
            net,
            network,
            probes,
            sweeper,
        })
    }

    pub fn identifier(&self) -> &NetMeshBaseIdentifier {
        self.net.identifier()
    }

    pub fn net(&self) -> &Arc<NetMeshBase> {
        &self.net
    }

    pub fn network(&self) -> &Arc<MemoryMeshNetwork> {
        &self.network
    }

    pub fn probes(&self) -> &Arc<ProbeManager> {
        &self.probes
    }

    /// Replicate the home object of `source`, probing it first if nobody has
    /// yet. Accepts incomplete forms such as a bare host name.
    pub async fn access(&self, source: &str) -> NodeResult<MeshObject> {
        let source = NetMeshBaseIdentifier::guess_from_external_form(None, source)?;
        let home = MeshObjectIdentifier::home_object_of(&source);
        Ok(self.net.access_locally(&source, &home).await?)
    }

    /// Neighbors of `id` playing `role` towards it, replicated on the way.
    pub async fn traverse(
        &self,
        id: &MeshObjectIdentifier,
        role: &TypeIdentifier,
    ) -> NodeResult<Vec<MeshObject>> {
        Ok(self.net.traverse(id, role).await?)
    }

    pub fn sweep_once(&self) -> Option<SweepReport> {
        self.sweeper.as_ref().map(|s| s.sweep_once())
    }

    /// Log a one-line summary of what the node holds.
    pub fn log_status(&self) {
        info!(
            objects = self.net.mesh_base().size(),
            replicas = self.net.replicas().len(),
            shadows = self.probes.len(),
            "Node status"
        );
    }

    /// Stop scheduled work and ask partners to stop replicating.
    pub fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }
        self.probes.stop();
        for source in self.probes.sources() {
            self.probes.retire(&source);
        }
        self.net.die();
        info!(identifier = %self.identifier(), "Node stopped");
    }
}

/// Default interval between status lines when serving.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);
