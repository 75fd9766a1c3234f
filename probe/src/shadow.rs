//! Mesh bases mirroring one external resource.
//!
//! A shadow's identifier is the identifier of the resource it mirrors. Its
//! only initial proxy is a placeholder pointed at that resource, and every
//! run applies the probe's findings in a transaction attributed to it, so the
//! changes reach all other partners but are never sent towards the source.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use mesh_kernel::{
    now_millis, MeshBase, MeshObject, MeshObjectIdentifier, MeshResult, ModelBase,
    NetMeshBaseIdentifier, Store, TypeIdentifier,
};
use mesh_net::{AccessPath, NetMeshBase, ProxyPolicy};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    coherence::{CoherenceSpecification, RunOutcome},
    directory::ProbeDirectory,
    error::ProbeResult,
    fetcher::ContentFetcher,
    staging::StagingGraph,
};

/// Collaborators every shadow is built with.
#[derive(Clone)]
pub struct ProbeContext {
    pub model: Arc<ModelBase>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub directory: Arc<ProbeDirectory>,
    pub store: Option<Arc<dyn Store>>,
    pub policy: ProxyPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowStatus {
    pub runs: u64,
    /// Start of the run in progress, if any.
    pub current_update_started: Option<i64>,
    pub last_update_started: Option<i64>,
    pub last_successful_update_started: Option<i64>,
    /// Start of the last run that changed the shadow.
    pub last_changed: Option<i64>,
    pub delay_until_next_update: Option<Duration>,
    /// Why the last run failed. Cleared by the next successful run.
    pub last_problem: Option<String>,
}

pub struct ShadowMeshBase {
    net: Arc<NetMeshBase>,
    fetcher: Arc<dyn ContentFetcher>,
    directory: Arc<ProbeDirectory>,
    coherence: RwLock<CoherenceSpecification>,
    status: Mutex<ShadowStatus>,
    not_needed_since: Mutex<Option<i64>>,
    running: tokio::sync::Mutex<()>,
}

impl ShadowMeshBase {
    pub fn new(
        source: NetMeshBaseIdentifier,
        context: &ProbeContext,
        coherence: CoherenceSpecification,
    ) -> Arc<Self> {
        let mut builder = MeshBase::builder(source.clone(), Arc::clone(&context.model));
        if let Some(store) = &context.store {
            builder = builder.store(Arc::clone(store));
        }
        let net = NetMeshBase::new(builder.build(), context.policy.clone());
        net.obtain_proxy(&source);
        Arc::new(Self {
            net,
            fetcher: Arc::clone(&context.fetcher),
            directory: Arc::clone(&context.directory),
            coherence: RwLock::new(coherence),
            status: Mutex::new(ShadowStatus::default()),
            not_needed_since: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
        })
    }

    pub fn source(&self) -> &NetMeshBaseIdentifier {
        self.net.identifier()
    }

    pub fn net(&self) -> &Arc<NetMeshBase> {
        &self.net
    }

    pub fn mesh_base(&self) -> &Arc<MeshBase> {
        self.net.mesh_base()
    }

    pub fn home_object_identifier(&self) -> MeshObjectIdentifier {
        self.mesh_base().home_object_identifier()
    }

    pub fn status(&self) -> ShadowStatus {
        self.status.lock().clone()
    }

    pub fn coherence(&self) -> CoherenceSpecification {
        self.coherence.read().clone()
    }

    pub fn set_coherence(&self, coherence: CoherenceSpecification) {
        *self.coherence.write() = coherence;
    }

    /// Whether any partner other than the source holds a replica.
    pub fn is_needed(&self) -> bool {
        let replicas = self.net.replicas();
        self.mesh_base().identifiers().iter().any(|id| {
            replicas
                .get(id)
                .is_some_and(|s| s.proxies.iter().any(|p| p != self.source()))
        })
    }

    /// Not needed by anybody for at least `grace`.
    pub fn may_be_retired(&self, now: i64, grace: Duration) -> bool {
        self.track_need(now);
        self.not_needed_since
            .lock()
            .is_some_and(|since| now - since >= grace.as_millis() as i64)
    }

    fn track_need(&self, now: i64) {
        let needed = self.is_needed();
        let mut since = self.not_needed_since.lock();
        if needed {
            *since = None;
        } else if since.is_none() {
            *since = Some(now);
        }
    }

    /// Load what an earlier process flushed for this shadow.
    pub async fn restore(&self) -> ProbeResult<usize> {
        Ok(self.mesh_base().restore().await?)
    }

    /// Run the probe once and return the delay until the next run, if any.
    ///
    /// A failed run leaves the shadow as it was and records the problem.
    pub async fn run_now(&self) -> ProbeResult<Option<Duration>> {
        let _running = self.running.lock().await;
        let started = now_millis();
        self.status.lock().current_update_started = Some(started);

        let result = self.update(started).await;

        let outcome = match &result {
            Ok(true) => RunOutcome::Changed,
            Ok(false) => RunOutcome::Unchanged,
            Err(_) => RunOutcome::Failed,
        };
        let next = {
            let mut status = self.status.lock();
            let next = self
                .coherence
                .read()
                .next_delay(status.delay_until_next_update, outcome);
            status.runs += 1;
            status.current_update_started = None;
            status.last_update_started = Some(started);
            status.delay_until_next_update = next;
            match &result {
                Ok(changed) => {
                    status.last_successful_update_started = Some(started);
                    if *changed {
                        status.last_changed = Some(started);
                    }
                    status.last_problem = None;
                }
                Err(e) => status.last_problem = Some(e.to_string()),
            }
            next
        };
        self.track_need(started);

        match &result {
            Ok(changed) => debug!(
                source = %self.source(),
                changed,
                next = ?next,
                elapsed_ms = now_millis() - started,
                "Probe run completed"
            ),
            Err(e) => warn!(source = %self.source(), error = %e, next = ?next, "Probe run failed"),
        }
        result.map(|_| next)
    }

    async fn update(&self, started: i64) -> ProbeResult<bool> {
        let content = self.fetcher.fetch(self.source()).await?;
        let probe = self
            .directory
            .select(self.source(), content.content_type.as_deref())?;
        let mut graph = StagingGraph::new(self.source().clone());
        probe.parse(&content, &mut graph)?;

        let changed = self.apply(&graph, started)?;
        let base = self.mesh_base();

        if base.is_dirty() {
            let written = base.flush().await?;
            debug!(source = %self.source(), written, "Flushed shadow");
        }
        Ok(changed)
    }

    /// Make the shadow match `graph` in one transaction stamped with
    /// `started`. Returns whether anything changed.
    fn apply(&self, graph: &StagingGraph, started: i64) -> ProbeResult<bool> {
        let base = self.mesh_base();
        let replicas = self.net.replicas();
        let model = base.model();
        let wanted = graph.wanted_identifiers();
        let own_prefix = format!("{}#", self.source().as_str());

        let mut wanted_roles = graph.relationships().clone();
        for link in graph.forward_links() {
            wanted_roles
                .entry((link.from.clone(), link.stub.clone()))
                .or_default()
                .insert(link.role.clone());
        }
        // roles each side ends up playing, inverse roles included
        let mut expected: BTreeMap<(MeshObjectIdentifier, MeshObjectIdentifier), BTreeSet<TypeIdentifier>> =
            BTreeMap::new();
        for ((a, b), roles) in &wanted_roles {
            expected
                .entry((a.clone(), b.clone()))
                .or_default()
                .extend(roles.iter().cloned());
            let inverse = expected.entry((b.clone(), a.clone())).or_default();
            for role in roles {
                if let Ok(rt) = model.inverse_role(role) {
                    inverse.insert(rt.id.clone());
                }
            }
        }

        let mut tx = base.begin_transaction_at(self.source().clone(), started);
        tx.with_sudo(|tx| -> MeshResult<()> {
            let now = tx.time();

            // what the source no longer has
            for id in tx.identifiers() {
                let ours = id == graph.home() || id.as_str().starts_with(&own_prefix);
                if ours && !wanted.contains(&id) && tx.contains(&id) {
                    tx.delete(&id)?;
                }
            }

            for (id, staged) in graph.objects() {
                if !tx.contains(id) {
                    tx.create(Some(id.clone()), &[])?;
                }
                let current = tx.get(id)?.clone();
                let stale: Vec<_> = current
                    .types()
                    .iter()
                    .filter(|t| !staged.types.contains(*t))
                    .cloned()
                    .collect();
                if !stale.is_empty() {
                    tx.unbless(id, &stale)?;
                }
                let fresh: Vec<_> = staged
                    .types
                    .iter()
                    .filter(|t| !current.types().contains(*t))
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    tx.bless(id, &fresh)?;
                }

                let current = tx.get(id)?.clone();
                for property in current.properties().keys() {
                    if !staged.properties.contains_key(property) {
                        tx.set_property(id, property, None)?;
                    }
                }
                for (property, value) in &staged.properties {
                    if current.property(property) != Some(value) {
                        tx.set_property(id, property, Some(value.clone()))?;
                    }
                }
            }

            for link in graph.forward_links() {
                if !tx.contains(&link.stub) {
                    tx.create_replica(MeshObject::stub(link.stub.clone(), now))?;
                }
            }

            for id in graph.objects().keys() {
                let current = tx.get(id)?.clone();
                for neighbor in current.neighbors() {
                    let pair = (id.clone(), neighbor.clone());
                    if wanted.contains(neighbor) && !expected.contains_key(&pair) {
                        tx.unrelate(id, neighbor)?;
                    }
                }
            }
            for ((a, b), roles) in &wanted_roles {
                let current = tx.get(a)?.roles_towards(b).cloned();
                match current {
                    None => {
                        let roles: Vec<_> = roles.iter().cloned().collect();
                        tx.relate_and_bless(a, b, &roles)?;
                    }
                    Some(current) => {
                        let pair = (a.clone(), b.clone());
                        let extra: Vec<_> = current
                            .iter()
                            .filter(|r| !expected.get(&pair).is_some_and(|e| e.contains(*r)))
                            .cloned()
                            .collect();
                        if !extra.is_empty() {
                            tx.unbless_relationship(a, b, &extra)?;
                        }
                        let missing: Vec<_> = roles
                            .iter()
                            .filter(|r| !current.contains(*r))
                            .cloned()
                            .collect();
                        if !missing.is_empty() {
                            tx.bless_relationship(a, b, &missing)?;
                        }
                    }
                }
            }
            Ok(())
        })?;

        // restored stubs have no replication state yet either
        for link in graph.forward_links() {
            if tx.contains(&link.stub) {
                let path = AccessPath::to(link.target.clone()).with_target(link.target_object());
                replicas.register_forward_reference(&link.stub, path);
            }
        }
        let changes = tx.commit();
        if !changes.is_empty() {
            info!(
                source = %self.source(),
                events = changes.len(),
                objects = base.size(),
                "Shadow updated"
            );
        }
        Ok(!changes.is_empty())
    }
}
