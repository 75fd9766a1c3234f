//! Per-object replication state: who we replicate with, where the home
//! replica and the lock are, and how to reach forward references.
//!
//! Objects without an entry were created here and never shared, so the local
//! mesh base is both home and lock holder for them.
//!
//! The table has its own mutex. It may be taken while a transaction is open,
//! but a transaction must never be opened while it is held.

use std::collections::{BTreeSet, HashMap};

use mesh_kernel::{MeshObjectIdentifier, NetMeshBaseIdentifier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::policy::ProxyPolicy;

/// Where the real content of a forward reference lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPath {
    pub partner: NetMeshBaseIdentifier,
    /// Identifier of the object at the partner, when it differs from the local one.
    pub target: Option<MeshObjectIdentifier>,
}

impl AccessPath {
    pub fn to(partner: NetMeshBaseIdentifier) -> Self {
        Self {
            partner,
            target: None,
        }
    }

    pub fn with_target(mut self, target: MeshObjectIdentifier) -> Self {
        self.target = Some(target);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaState {
    /// Partners holding or receiving replicas of this object.
    pub proxies: BTreeSet<NetMeshBaseIdentifier>,
    /// `None` when the local replica is the home replica.
    pub towards_home: Option<NetMeshBaseIdentifier>,
    /// `None` when the local replica holds the lock.
    pub towards_lock: Option<NetMeshBaseIdentifier>,
    pub will_give_up_lock: bool,
    pub will_give_up_home_replica: bool,
    pub access_path: Option<AccessPath>,
    pub is_forward_reference: bool,
}

impl ReplicaState {
    pub fn home(policy: &ProxyPolicy) -> Self {
        Self {
            proxies: BTreeSet::new(),
            towards_home: None,
            towards_lock: None,
            will_give_up_lock: policy.will_give_up_lock,
            will_give_up_home_replica: policy.will_give_up_home_replica,
            access_path: None,
            is_forward_reference: false,
        }
    }

    pub fn replica_of(partner: NetMeshBaseIdentifier, policy: &ProxyPolicy) -> Self {
        Self {
            proxies: BTreeSet::from([partner.clone()]),
            towards_home: Some(partner.clone()),
            towards_lock: Some(partner),
            ..Self::home(policy)
        }
    }

    pub fn forward_reference(path: AccessPath, policy: &ProxyPolicy) -> Self {
        Self {
            towards_home: Some(path.partner.clone()),
            towards_lock: Some(path.partner.clone()),
            access_path: Some(path),
            is_forward_reference: true,
            ..Self::home(policy)
        }
    }

    pub fn has_lock(&self) -> bool {
        self.towards_lock.is_none()
    }

    pub fn is_home(&self) -> bool {
        self.towards_home.is_none()
    }
}

pub struct ReplicaTable {
    policy: ProxyPolicy,
    entries: Mutex<HashMap<MeshObjectIdentifier, ReplicaState>>,
}

impl ReplicaTable {
    pub fn new(policy: ProxyPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &MeshObjectIdentifier) -> Option<ReplicaState> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_lock(&self, id: &MeshObjectIdentifier) -> bool {
        self.entries.lock().get(id).map_or(true, ReplicaState::has_lock)
    }

    pub fn is_home(&self, id: &MeshObjectIdentifier) -> bool {
        self.entries.lock().get(id).map_or(true, ReplicaState::is_home)
    }

    pub fn is_forward_reference(&self, id: &MeshObjectIdentifier) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|s| s.is_forward_reference)
    }

    pub fn is_replicated_with(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|s| s.proxies.contains(partner))
    }

    pub fn replicated_with(&self, partner: &NetMeshBaseIdentifier) -> Vec<MeshObjectIdentifier> {
        let mut ids: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, s)| s.proxies.contains(partner))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// We are sending a replica of `id` to `partner`.
    pub fn register_replication(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) {
        self.entries
            .lock()
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy))
            .proxies
            .insert(partner.clone());
    }

    /// We received a snapshot of `id` from `partner`. Unknown objects and
    /// forward references become replicas whose home and lock lie with the
    /// partner.
    pub fn register_replica_from(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(state) if !state.is_forward_reference => {
                state.proxies.insert(partner.clone());
            }
            Some(state) => {
                let (lock, home) = (state.will_give_up_lock, state.will_give_up_home_replica);
                *state = ReplicaState::replica_of(partner.clone(), &self.policy);
                state.will_give_up_lock = lock;
                state.will_give_up_home_replica = home;
            }
            None => {
                entries.insert(
                    id.clone(),
                    ReplicaState::replica_of(partner.clone(), &self.policy),
                );
            }
        }
    }

    /// Returns false if `id` already has replication state.
    pub fn register_forward_reference(&self, id: &MeshObjectIdentifier, path: AccessPath) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.clone(), ReplicaState::forward_reference(path, &self.policy));
        true
    }

    /// Turn a purged replica back into a forward reference towards its home.
    pub fn convert_to_forward_reference(&self, id: &MeshObjectIdentifier, path: AccessPath) {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        state.proxies.remove(&path.partner);
        state.towards_home = Some(path.partner.clone());
        state.towards_lock = Some(path.partner.clone());
        state.access_path = Some(path);
        state.is_forward_reference = true;
    }

    /// Point an existing forward reference somewhere else. Returns false if
    /// `id` is not a forward reference.
    pub fn redirect_forward_reference(&self, id: &MeshObjectIdentifier, path: AccessPath) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(state) if state.is_forward_reference => {
                state.towards_home = Some(path.partner.clone());
                state.towards_lock = Some(path.partner.clone());
                state.access_path = Some(path);
                true
            }
            _ => false,
        }
    }

    /// Hand the lock to `partner` if we hold it and may give it up.
    pub fn surrender_lock_if_held(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) -> bool {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        if !state.has_lock() || !state.will_give_up_lock {
            return false;
        }
        state.towards_lock = Some(partner.clone());
        state.proxies.insert(partner.clone());
        true
    }

    /// The partner reclaimed the lock; it is theirs whatever we thought.
    pub fn surrender_lock(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) {
        let mut entries = self.entries.lock();
        if let Some(state) = entries.get_mut(id) {
            state.towards_lock = Some(partner.clone());
            state.proxies.insert(partner.clone());
        }
    }

    pub fn acquire_lock(&self, id: &MeshObjectIdentifier, from: Option<&NetMeshBaseIdentifier>) {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        state.towards_lock = None;
        if let Some(from) = from {
            state.proxies.insert(from.clone());
        }
    }

    pub fn surrender_home_if_held(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) -> bool {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        if !state.is_home() || !state.will_give_up_home_replica {
            return false;
        }
        state.towards_home = Some(partner.clone());
        state.proxies.insert(partner.clone());
        true
    }

    /// Voluntarily pass the lock to `partner`, ignoring the give-up flag.
    pub fn hand_over_lock(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) -> bool {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        if !state.has_lock() {
            return false;
        }
        state.towards_lock = Some(partner.clone());
        state.proxies.insert(partner.clone());
        true
    }

    pub fn hand_over_home(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) -> bool {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        if !state.is_home() {
            return false;
        }
        state.towards_home = Some(partner.clone());
        state.proxies.insert(partner.clone());
        true
    }

    pub fn acquire_home(&self, id: &MeshObjectIdentifier, from: &NetMeshBaseIdentifier) {
        let mut entries = self.entries.lock();
        let state = entries
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy));
        state.towards_home = None;
        state.proxies.insert(from.clone());
    }

    pub fn set_will_give_up_lock(&self, id: &MeshObjectIdentifier, value: bool) {
        self.entries
            .lock()
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy))
            .will_give_up_lock = value;
    }

    pub fn set_will_give_up_home_replica(&self, id: &MeshObjectIdentifier, value: bool) {
        self.entries
            .lock()
            .entry(id.clone())
            .or_insert_with(|| ReplicaState::home(&self.policy))
            .will_give_up_home_replica = value;
    }

    /// `partner` no longer wants updates for `id`.
    pub fn cancel_replication(&self, id: &MeshObjectIdentifier, partner: &NetMeshBaseIdentifier) {
        if let Some(state) = self.entries.lock().get_mut(id) {
            state.proxies.remove(partner);
        }
    }

    /// Drop `partner` from every object's replication set.
    pub fn forget_partner(&self, partner: &NetMeshBaseIdentifier) {
        for state in self.entries.lock().values_mut() {
            state.proxies.remove(partner);
        }
    }

    pub fn remove(&self, id: &MeshObjectIdentifier) -> Option<ReplicaState> {
        self.entries.lock().remove(id)
    }
}
