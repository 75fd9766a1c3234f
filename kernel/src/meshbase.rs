//! The mesh base: owner of the object graph, entry point for transactions,
//! reads, change listeners and persistence.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    access::{AccessManager, CallerContext, PermitAllAccessManager},
    error::{MeshError, MeshResult},
    event::ChangeSet,
    identifier::{MeshObjectIdentifier, NetMeshBaseIdentifier},
    model::{ModelBase, TypeIdentifier},
    object::MeshObject,
    store::{Store, StoreValue},
    transaction::Transaction,
    value::PropertyValue,
};

const ENCODING_ID: &str = "json";

/// Notified after every committed transaction, outside the mesh base lock.
pub trait ChangeSetListener: Send + Sync {
    fn transaction_committed(&self, base: &MeshBase, changes: &ChangeSet);
}

/// Consulted before any mutation of an existing object.
///
/// `origin` is `Some` when the mutation replays a change received from a partner.
pub trait MutationGuard: Send + Sync {
    fn check_may_mutate(
        &self,
        object: &MeshObjectIdentifier,
        origin: Option<&NetMeshBaseIdentifier>,
    ) -> MeshResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum ListenerRef {
    Strong(Arc<dyn ChangeSetListener>),
    Weak(Weak<dyn ChangeSetListener>),
}

impl ListenerRef {
    fn upgrade(&self) -> Option<Arc<dyn ChangeSetListener>> {
        match self {
            Self::Strong(l) => Some(Arc::clone(l)),
            Self::Weak(l) => l.upgrade(),
        }
    }
}

#[derive(Default)]
pub(crate) struct GraphState {
    pub(crate) objects: HashMap<MeshObjectIdentifier, MeshObject>,
    pub(crate) dirty: BTreeSet<MeshObjectIdentifier>,
    pub(crate) deleted: BTreeSet<MeshObjectIdentifier>,
}

pub struct MeshBase {
    identifier: NetMeshBaseIdentifier,
    pub(crate) model: Arc<ModelBase>,
    pub(crate) access: Arc<dyn AccessManager>,
    store: Option<Arc<dyn Store>>,
    pub(crate) state: RwLock<GraphState>,
    guard: RwLock<Option<Arc<dyn MutationGuard>>>,
    listeners: Mutex<Vec<(ListenerId, ListenerRef)>>,
    next_listener_id: AtomicU64,
}

pub struct MeshBaseBuilder {
    identifier: NetMeshBaseIdentifier,
    model: Arc<ModelBase>,
    access: Arc<dyn AccessManager>,
    store: Option<Arc<dyn Store>>,
}

impl MeshBaseBuilder {
    pub fn access_manager(mut self, access: Arc<dyn AccessManager>) -> Self {
        self.access = access;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Arc<MeshBase> {
        Arc::new(MeshBase {
            identifier: self.identifier,
            model: self.model,
            access: self.access,
            store: self.store,
            state: RwLock::new(GraphState::default()),
            guard: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }
}

impl MeshBase {
    pub fn builder(identifier: NetMeshBaseIdentifier, model: Arc<ModelBase>) -> MeshBaseBuilder {
        MeshBaseBuilder {
            identifier,
            model,
            access: Arc::new(PermitAllAccessManager),
            store: None,
        }
    }

    pub fn identifier(&self) -> &NetMeshBaseIdentifier {
        &self.identifier
    }

    pub fn model(&self) -> &ModelBase {
        &self.model
    }

    pub fn home_object_identifier(&self) -> MeshObjectIdentifier {
        MeshObjectIdentifier::home_object_of(&self.identifier)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a local transaction. Blocks while another transaction is open.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        self.open_transaction(None, None)
    }

    /// Begin a transaction replaying changes received from `origin`.
    pub fn begin_transaction_from(&self, origin: NetMeshBaseIdentifier) -> Transaction<'_> {
        self.open_transaction(Some(origin), None)
    }

    /// Like [`begin_transaction_from`](Self::begin_transaction_from), but
    /// every mutation is time-stamped with `time` instead of the clock, e.g.
    /// the start of a probe run. Other transactions are unaffected.
    pub fn begin_transaction_at(&self, origin: NetMeshBaseIdentifier, time: i64) -> Transaction<'_> {
        self.open_transaction(Some(origin), Some(time))
    }

    fn open_transaction(
        &self,
        origin: Option<NetMeshBaseIdentifier>,
        time: Option<i64>,
    ) -> Transaction<'_> {
        let guard = self.guard.read().clone();
        let state = self.state.write();
        let now = time.unwrap_or_else(|| self.current_time());
        Transaction::new(self, state, origin, guard, now)
    }

    pub fn current_time(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn set_mutation_guard(&self, guard: Option<Arc<dyn MutationGuard>>) {
        *self.guard.write() = guard;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn find(&self, identifier: &MeshObjectIdentifier) -> Option<MeshObject> {
        self.state.read().objects.get(identifier).cloned()
    }

    pub fn get(&self, identifier: &MeshObjectIdentifier) -> MeshResult<MeshObject> {
        self.find(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.to_string()))
    }

    pub fn contains(&self, identifier: &MeshObjectIdentifier) -> bool {
        self.state.read().objects.contains_key(identifier)
    }

    pub fn size(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn identifiers(&self) -> Vec<MeshObjectIdentifier> {
        let mut ids: Vec<_> = self.state.read().objects.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn objects(&self) -> Vec<MeshObject> {
        let mut objects: Vec<_> = self.state.read().objects.values().cloned().collect();
        objects.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        objects
    }

    pub fn property(
        &self,
        identifier: &MeshObjectIdentifier,
        property: &TypeIdentifier,
    ) -> MeshResult<Option<PropertyValue>> {
        let state = self.state.read();
        let object = state
            .objects
            .get(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.to_string()))?;
        Ok(object.property(property).cloned())
    }

    pub fn traverse(
        &self,
        identifier: &MeshObjectIdentifier,
        role: &TypeIdentifier,
    ) -> MeshResult<Vec<MeshObject>> {
        self.traverse_as(&CallerContext::anonymous(), identifier, role)
    }

    /// Neighbors reached from `identifier` by playing `role`. Neighbors not
    /// held locally are skipped.
    pub fn traverse_as(
        &self,
        ctx: &CallerContext,
        identifier: &MeshObjectIdentifier,
        role: &TypeIdentifier,
    ) -> MeshResult<Vec<MeshObject>> {
        let state = self.state.read();
        let object = state
            .objects
            .get(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.to_string()))?;
        if !ctx.sudo {
            self.access.check_permitted_traversal(ctx, object, role)?;
        }
        Ok(object
            .neighbors_by_role(role)
            .into_iter()
            .filter_map(|n| state.objects.get(n).cloned())
            .collect())
    }

    /// Record that an object was read, for sweeping policies.
    pub fn record_read(&self, identifier: &MeshObjectIdentifier) {
        let now = self.current_time();
        if let Some(object) = self.state.write().objects.get_mut(identifier) {
            object.time_read = object.time_read.max(now);
        }
    }

    /// Replace an object's content with an empty stub without emitting events.
    /// Used when purging replicas whose content can be fetched again.
    pub fn purge_to_stub(&self, identifier: &MeshObjectIdentifier) -> MeshResult<()> {
        let now = self.current_time();
        let mut state = self.state.write();
        let object = state
            .objects
            .get_mut(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.to_string()))?;
        object.types.clear();
        object.properties.clear();
        object.time_updated = object.time_updated.max(now);
        state.dirty.insert(identifier.clone());
        debug!(object = %identifier, "Purged replica content");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ChangeSetListener>) -> ListenerId {
        self.push_listener(ListenerRef::Strong(listener))
    }

    /// The listener is dropped automatically once nothing else holds it.
    pub fn add_weak_listener(&self, listener: &Arc<dyn ChangeSetListener>) -> ListenerId {
        self.push_listener(ListenerRef::Weak(Arc::downgrade(listener)))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    fn push_listener(&self, listener: ListenerRef) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn notify(&self, changes: &ChangeSet) {
        let live: Vec<Arc<dyn ChangeSetListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|(_, l)| match l {
                ListenerRef::Weak(w) => w.strong_count() > 0,
                ListenerRef::Strong(_) => true,
            });
            listeners.iter().filter_map(|(_, l)| l.upgrade()).collect()
        };
        for listener in live {
            listener.transaction_committed(self, changes);
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        !state.dirty.is_empty() || !state.deleted.is_empty()
    }

    fn store_key(&self, identifier: &MeshObjectIdentifier) -> String {
        format!("{}|{}", self.identifier, identifier)
    }

    /// Write changed objects to the store and remove deleted ones.
    ///
    /// Returns the number of records written or removed. Without a store this
    /// only clears the dirty markers.
    pub async fn flush(&self) -> MeshResult<usize> {
        let (updated, deleted) = {
            let mut state = self.state.write();
            let dirty = std::mem::take(&mut state.dirty);
            let deleted = std::mem::take(&mut state.deleted);
            let updated: Vec<MeshObject> = dirty
                .iter()
                .filter_map(|id| state.objects.get(id).cloned())
                .collect();
            (updated, deleted)
        };

        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };

        let mut written = 0;
        for (index, object) in updated.iter().enumerate() {
            let value = self.encode(object)?;
            if let Err(e) = store.put_or_update(value).await {
                self.remark_dirty(updated[index..].iter().map(|o| o.identifier().clone()));
                return Err(e.into());
            }
            written += 1;
        }
        for id in &deleted {
            match store.delete(&self.store_key(id)).await {
                Ok(()) => written += 1,
                Err(crate::store::StoreError::KeyDoesNotExist(_)) => {}
                Err(e) => {
                    warn!(object = %id, error = %e, "Failed to remove deleted object from store");
                    self.state.write().deleted.insert(id.clone());
                }
            }
        }
        debug!(base = %self.identifier, written, "Flushed mesh base");
        Ok(written)
    }

    fn remark_dirty(&self, ids: impl Iterator<Item = MeshObjectIdentifier>) {
        let mut state = self.state.write();
        state.dirty.extend(ids);
    }

    fn encode(&self, object: &MeshObject) -> MeshResult<StoreValue> {
        let data = serde_json::to_vec(object).map_err(|e| MeshError::Encoding {
            identifier: object.identifier().to_string(),
            reason: e.to_string(),
        })?;
        Ok(StoreValue {
            key: self.store_key(object.identifier()),
            encoding_id: ENCODING_ID.to_string(),
            time_created: object.time_created(),
            time_updated: object.time_updated(),
            time_read: object.time_read(),
            time_expires: object.time_expires(),
            data,
        })
    }

    /// Load every object of this mesh base from the store, replacing what is
    /// held in memory. No change events are emitted.
    pub async fn restore(&self) -> MeshResult<usize> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        let prefix = format!("{}|", self.identifier);
        let mut loaded = Vec::new();
        for key in store.keys_with_prefix(&prefix).await? {
            let value = store.get(&key).await?;
            if value.encoding_id != ENCODING_ID {
                warn!(key = %key, encoding = %value.encoding_id, "Skipping record with unknown encoding");
                continue;
            }
            let object: MeshObject =
                serde_json::from_slice(&value.data).map_err(|e| MeshError::Encoding {
                    identifier: key.clone(),
                    reason: e.to_string(),
                })?;
            loaded.push(object);
        }
        let count = loaded.len();
        let mut state = self.state.write();
        state.objects = loaded
            .into_iter()
            .map(|o| (o.identifier().clone(), o))
            .collect();
        state.dirty.clear();
        state.deleted.clear();
        info!(base = %self.identifier, count, "Restored mesh base from store");
        Ok(count)
    }
}

impl std::fmt::Debug for MeshBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshBase")
            .field("identifier", &self.identifier)
            .field("size", &self.size())
            .finish()
    }
}
