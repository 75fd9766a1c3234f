//! A mesh base that replicates with partners through proxies.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use dashmap::DashMap;
use mesh_comm::{InvocationIdGenerator, MessageEndpoint};
use mesh_kernel::{
    ChangeEvent, ChangeSet, ChangeSetListener, MeshBase, MeshError, MeshObject,
    MeshObjectIdentifier, MeshResult, MutationGuard, NetMeshBaseIdentifier, Purger,
    TypeIdentifier,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{NetError, NetResult},
    message::XprisoMessage,
    network::ProxyEndpointFactory,
    policy::ProxyPolicy,
    proxy::{Proxy, ProxyState},
    replica::{AccessPath, ReplicaState, ReplicaTable},
};

/// How many times `resolve` follows a forward reference that a partner
/// reports to live elsewhere.
const MAX_REDIRECTS: usize = 4;

/// Local mutations require the lock. Replayed remote changes were already
/// checked by the lock holder.
struct LockGuard {
    replicas: Arc<ReplicaTable>,
}

impl MutationGuard for LockGuard {
    fn check_may_mutate(
        &self,
        object: &MeshObjectIdentifier,
        origin: Option<&NetMeshBaseIdentifier>,
    ) -> MeshResult<()> {
        if origin.is_some() || self.replicas.has_lock(object) {
            return Ok(());
        }
        Err(MeshError::not_permitted(
            "mutate",
            object,
            "the lock is held by another replica",
        ))
    }
}

struct CommitForwarder {
    net: Weak<NetMeshBase>,
}

impl ChangeSetListener for CommitForwarder {
    fn transaction_committed(&self, _base: &MeshBase, changes: &ChangeSet) {
        if let Some(net) = self.net.upgrade() {
            net.on_commit(changes);
        }
    }
}

pub struct NetMeshBase {
    base: Arc<MeshBase>,
    policy: ProxyPolicy,
    replicas: Arc<ReplicaTable>,
    proxies: DashMap<NetMeshBaseIdentifier, Arc<Proxy>>,
    factory: RwLock<Option<Arc<dyn ProxyEndpointFactory>>>,
    ids: Arc<InvocationIdGenerator>,
    dead: AtomicBool,
    self_ref: Weak<NetMeshBase>,
}

impl NetMeshBase {
    pub fn new(base: Arc<MeshBase>, policy: ProxyPolicy) -> Arc<Self> {
        let replicas = Arc::new(ReplicaTable::new(policy.clone()));
        base.set_mutation_guard(Some(Arc::new(LockGuard {
            replicas: Arc::clone(&replicas),
        })));
        let net = Arc::new_cyclic(|weak| Self {
            base,
            policy,
            replicas,
            proxies: DashMap::new(),
            factory: RwLock::new(None),
            ids: Arc::new(InvocationIdGenerator::new()),
            dead: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        net.base.add_listener(Arc::new(CommitForwarder {
            net: Arc::downgrade(&net),
        }));
        info!(identifier = %net.identifier(), "Net mesh base created");
        net
    }

    pub fn identifier(&self) -> &NetMeshBaseIdentifier {
        self.base.identifier()
    }

    pub fn mesh_base(&self) -> &Arc<MeshBase> {
        &self.base
    }

    pub fn replicas(&self) -> &ReplicaTable {
        &self.replicas
    }

    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn set_endpoint_factory(&self, factory: Arc<dyn ProxyEndpointFactory>) {
        *self.factory.write() = Some(factory);
    }

    pub fn proxy(&self, partner: &NetMeshBaseIdentifier) -> Option<Arc<Proxy>> {
        self.proxies.get(partner).map(|p| Arc::clone(p.value()))
    }

    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.iter().map(|p| Arc::clone(p.value())).collect()
    }

    /// The proxy for `partner`, created as a placeholder if there is none.
    pub fn obtain_proxy(&self, partner: &NetMeshBaseIdentifier) -> Arc<Proxy> {
        let entry = self.proxies.entry(partner.clone()).or_insert_with(|| {
            debug!(local = %self.identifier(), partner = %partner, "Creating proxy");
            Proxy::new(
                self.identifier().clone(),
                partner.clone(),
                self.self_ref.clone(),
                Arc::clone(&self.ids),
                self.policy.rpc_timeout(),
            )
        });
        Arc::clone(entry.value())
    }

    fn ensure_alive(&self) -> NetResult<()> {
        if self.is_dead() {
            return Err(NetError::Dead(self.identifier().clone()));
        }
        Ok(())
    }

    /// Activate the proxy for `partner` over an endpoint that is already
    /// running. Used by the side that accepts a connection.
    pub fn connect_with(
        &self,
        partner: &NetMeshBaseIdentifier,
        endpoint: Arc<dyn MessageEndpoint<XprisoMessage>>,
    ) -> Arc<Proxy> {
        let proxy = self.obtain_proxy(partner);
        proxy.activate(endpoint);
        proxy
    }

    /// An active proxy for `partner`, opening an endpoint through the
    /// factory if needed.
    pub async fn connect(&self, partner: &NetMeshBaseIdentifier) -> NetResult<Arc<Proxy>> {
        self.ensure_alive()?;
        let proxy = self.obtain_proxy(partner);
        {
            let gate = Arc::clone(&proxy);
            let _connecting = gate.connecting().await;
            if !proxy.is_active() {
                let factory = self
                    .factory
                    .read()
                    .clone()
                    .ok_or_else(|| NetError::NoEndpointFactory(partner.clone()))?;
                let endpoint = factory.connect(self.identifier(), partner).await?;
                proxy.activate(endpoint);
            }
        }
        Ok(proxy)
    }

    /// The local replica of `id`, obtaining it from `partner` if we have none.
    pub async fn access_locally(
        &self,
        partner: &NetMeshBaseIdentifier,
        id: &MeshObjectIdentifier,
    ) -> NetResult<MeshObject> {
        if self.base.contains(id) && !self.replicas.is_forward_reference(id) {
            self.base.record_read(id);
            return Ok(self.base.get(id)?);
        }
        let proxy = self.connect(partner).await?;
        proxy.obtain_replicas(std::slice::from_ref(id)).await?;
        if self.replicas.is_forward_reference(id) || !self.base.contains(id) {
            return Err(NetError::NotAvailable {
                partner: partner.clone(),
                identifier: id.clone(),
            });
        }
        self.base.record_read(id);
        Ok(self.base.get(id)?)
    }

    /// Add a content-free placeholder for an object that lives at `path`.
    pub fn create_forward_reference(
        &self,
        id: &MeshObjectIdentifier,
        path: AccessPath,
    ) -> NetResult<MeshObject> {
        let stub = {
            let mut tx = self.base.begin_transaction();
            let now = tx.time();
            let stub = MeshObject::stub(id.clone(), now);
            tx.with_sudo(|tx| tx.create_replica(stub.clone()))?;
            if !self.replicas.register_forward_reference(id, path.clone()) {
                return Err(MeshError::IdentifierNotUnique(id.to_string()).into());
            }
            tx.commit();
            stub
        };
        debug!(object = %id, partner = %path.partner, "Created forward reference");
        Ok(stub)
    }

    /// Make sure `id` has real content, obtaining it through its access path
    /// when it is a forward reference.
    pub async fn resolve(&self, id: &MeshObjectIdentifier) -> NetResult<MeshObject> {
        let mut redirects = 0;
        loop {
            let Some(state) = self.replicas.get(id).filter(|s| s.is_forward_reference) else {
                self.base.record_read(id);
                return Ok(self.base.get(id)?);
            };
            let path = state
                .access_path
                .ok_or_else(|| NetError::NoAccessPath(id.clone()))?;
            let target = path.target.clone().unwrap_or_else(|| id.clone());

            match self.obtain_through(&path.partner, &target).await {
                Ok(()) => {
                    if target != *id {
                        self.link_equivalent(&path.partner, id, &target)?;
                    }
                    self.base.record_read(&target);
                    return Ok(self.base.get(&target)?);
                }
                Err(e) => {
                    // the partner may have told us where the content really is
                    let moved = self
                        .replicas
                        .get(id)
                        .and_then(|s| s.access_path)
                        .is_some_and(|p| p != path);
                    if !moved || redirects >= MAX_REDIRECTS {
                        return Err(e);
                    }
                    redirects += 1;
                    debug!(object = %id, from = %path.partner, "Following forward reference redirect");
                }
            }
        }
    }

    async fn obtain_through(
        &self,
        partner: &NetMeshBaseIdentifier,
        target: &MeshObjectIdentifier,
    ) -> NetResult<()> {
        let proxy = self.connect(partner).await?;
        proxy.obtain_replicas(std::slice::from_ref(target)).await?;
        if self.replicas.is_forward_reference(target) || !self.base.contains(target) {
            return Err(NetError::NotAvailable {
                partner: partner.clone(),
                identifier: target.clone(),
            });
        }
        Ok(())
    }

    fn link_equivalent(
        &self,
        partner: &NetMeshBaseIdentifier,
        local: &MeshObjectIdentifier,
        remote: &MeshObjectIdentifier,
    ) -> MeshResult<()> {
        let mut tx = self.base.begin_transaction_from(partner.clone());
        if !tx.get(local)?.equivalents().contains(remote) {
            tx.add_equivalent(local, remote)?;
        }
        tx.commit();
        Ok(())
    }

    /// Neighbors of `id` reached by `role`, resolving forward references on
    /// the way. Neighbors that cannot be resolved are skipped.
    pub async fn traverse(
        &self,
        id: &MeshObjectIdentifier,
        role: &TypeIdentifier,
    ) -> NetResult<Vec<MeshObject>> {
        // access check on the start object
        self.base.traverse(id, role)?;
        let neighbors: Vec<MeshObjectIdentifier> = self
            .base
            .get(id)?
            .neighbors_by_role(role)
            .into_iter()
            .cloned()
            .collect();

        let mut found = Vec::with_capacity(neighbors.len());
        for neighbor in &neighbors {
            match self.resolve(neighbor).await {
                Ok(object) => found.push(object),
                Err(e) => warn!(object = %neighbor, error = %e, "Skipping unresolvable neighbor"),
            }
        }
        Ok(found)
    }

    fn group_by_partner(
        &self,
        ids: &[MeshObjectIdentifier],
        towards: impl Fn(&ReplicaState) -> Option<NetMeshBaseIdentifier>,
    ) -> BTreeMap<NetMeshBaseIdentifier, Vec<MeshObjectIdentifier>> {
        let mut grouped: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for id in ids {
            if let Some(partner) = self.replicas.get(id).as_ref().and_then(&towards) {
                grouped.entry(partner).or_default().push(id.clone());
            }
        }
        grouped
    }

    /// Ask the current lock holders for the locks of `ids`. Returns those we
    /// hold afterwards.
    pub async fn try_to_obtain_locks(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        for (partner, wanted) in self.group_by_partner(ids, |s| s.towards_lock.clone()) {
            let proxy = self.connect(&partner).await?;
            proxy.try_to_obtain_locks(&wanted).await?;
        }
        Ok(ids
            .iter()
            .filter(|id| self.replicas.has_lock(id))
            .cloned()
            .collect())
    }

    pub async fn try_to_obtain_home_replicas(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        for (partner, wanted) in self.group_by_partner(ids, |s| s.towards_home.clone()) {
            let proxy = self.connect(&partner).await?;
            proxy.try_to_obtain_home_replicas(&wanted).await?;
        }
        Ok(ids
            .iter()
            .filter(|id| self.replicas.is_home(id))
            .cloned()
            .collect())
    }

    pub async fn try_to_push_locks(
        &self,
        partner: &NetMeshBaseIdentifier,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let proxy = self.connect(partner).await?;
        proxy.try_to_push_locks(ids)
    }

    pub async fn try_to_push_home_replicas(
        &self,
        partner: &NetMeshBaseIdentifier,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        let proxy = self.connect(partner).await?;
        proxy.try_to_push_home_replicas(ids)
    }

    /// Reclaim the locks of home replicas from whoever holds them.
    pub async fn force_obtain_locks(
        &self,
        ids: &[MeshObjectIdentifier],
    ) -> NetResult<Vec<MeshObjectIdentifier>> {
        if let Some(id) = ids.iter().find(|id| !self.replicas.is_home(id)) {
            return Err(NetError::NotHomeReplica(id.clone()));
        }
        for (partner, wanted) in self.group_by_partner(ids, |s| s.towards_lock.clone()) {
            let proxy = self.connect(&partner).await?;
            proxy.force_obtain_locks(&wanted).await?;
        }
        Ok(ids
            .iter()
            .filter(|id| self.replicas.has_lock(id))
            .cloned()
            .collect())
    }

    pub fn set_will_give_up_lock(&self, id: &MeshObjectIdentifier, value: bool) {
        self.replicas.set_will_give_up_lock(id, value);
    }

    pub fn set_will_give_up_home_replica(&self, id: &MeshObjectIdentifier, value: bool) {
        self.replicas.set_will_give_up_home_replica(id, value);
    }

    /// Stop replicating: every active proxy asks its partner to cease.
    pub fn die(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(identifier = %self.identifier(), "Shutting down net mesh base");
        for proxy in self.proxies() {
            if proxy.state() != ProxyState::Active {
                continue;
            }
            if let Err(e) = proxy.initiate_cease_communications() {
                warn!(partner = %proxy.partner(), error = %e, "Failed to cease communications");
            }
        }
    }

    /// Apply one incoming message in a single transaction attributed to
    /// `partner`.
    ///
    /// Conveyed snapshots are all-or-nothing: if one cannot be instantiated
    /// the whole message is rolled back. Individual events that fail, for
    /// example because the access manager refuses them, are skipped.
    pub(crate) fn apply_incoming(
        &self,
        partner: &NetMeshBaseIdentifier,
        message: &XprisoMessage,
    ) -> MeshResult<ChangeSet> {
        if message.conveyed_objects.is_empty() && message.events.is_empty() {
            return Ok(ChangeSet::new());
        }
        let mut tx = self.base.begin_transaction_from(partner.clone());
        let mut stubs = Vec::new();
        tx.with_sudo(|tx| -> MeshResult<()> {
            let now = tx.time();
            for snapshot in &message.conveyed_objects {
                for neighbor in snapshot.neighbors() {
                    if !tx.contains(neighbor) {
                        tx.create_replica(MeshObject::stub(neighbor.clone(), now))?;
                        stubs.push(neighbor.clone());
                    }
                }
                if !tx.contains(snapshot.identifier()) {
                    tx.create_replica(snapshot.detached())?;
                }
            }
            for snapshot in &message.conveyed_objects {
                tx.resynchronize(snapshot)?;
            }
            Ok(())
        })?;

        for stub in &stubs {
            self.replicas
                .register_forward_reference(stub, AccessPath::to(partner.clone()));
        }
        for snapshot in &message.conveyed_objects {
            self.replicas
                .register_replica_from(snapshot.identifier(), partner);
        }

        let mut skipped = 0usize;
        for event in &message.events {
            if let Err(e) = tx.apply_change(event) {
                skipped += 1;
                if e.is_permission_error() {
                    warn!(
                        partner = %partner,
                        event = event.kind(),
                        object = %event.affected(),
                        error = %e,
                        "Incoming change not permitted, skipping"
                    );
                } else {
                    warn!(
                        partner = %partner,
                        event = event.kind(),
                        object = %event.affected(),
                        error = %e,
                        "Incoming change could not be applied, skipping"
                    );
                }
            }
        }
        let changes = tx.commit();
        debug!(
            partner = %partner,
            conveyed = message.conveyed_objects.len(),
            applied = changes.len(),
            skipped,
            "Applied incoming message"
        );
        Ok(changes)
    }

    fn on_commit(&self, changes: &ChangeSet) {
        for proxy in self.proxies() {
            proxy.transaction_committed(self, changes);
        }
        for change in changes {
            if let ChangeEvent::Deleted { object } = &change.event {
                self.replicas.remove(object.identifier());
            }
        }
    }
}

impl Purger for NetMeshBase {
    /// Purge replicas whose home lies elsewhere back to forward references.
    /// Home replicas are never purged.
    fn purge(&self, candidates: &[MeshObjectIdentifier]) -> MeshResult<usize> {
        let mut purged = 0;
        for id in candidates {
            let Some(home) = self.replicas.get(id).and_then(|s| {
                if s.is_forward_reference {
                    None
                } else {
                    s.towards_home
                }
            }) else {
                continue;
            };
            self.base.purge_to_stub(id)?;
            self.replicas
                .convert_to_forward_reference(id, AccessPath::to(home.clone()));
            if let Some(proxy) = self.proxy(&home) {
                if let Err(e) = proxy.cancel_replicas(std::slice::from_ref(id)) {
                    debug!(object = %id, partner = %home, error = %e, "Could not cancel purged replica");
                }
            }
            purged += 1;
        }
        Ok(purged)
    }
}
