//! The replication protocol message exchanged between proxies.

use std::collections::BTreeSet;

use mesh_comm::CarriesInvocationId;
use mesh_kernel::{ChangeEvent, MeshObject, MeshObjectIdentifier, NetMeshBaseIdentifier};
use serde::{Deserialize, Serialize};

use crate::replica::AccessPath;

/// One protocol message. Every field is optional; an empty message is only
/// sent to acknowledge a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XprisoMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<NetMeshBaseIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<NetMeshBaseIdentifier>,

    /// Objects the sender wants replicas of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_first_time_objects: Vec<MeshObjectIdentifier>,
    /// Replicas the sender no longer wants updates for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_canceled_objects: Vec<MeshObjectIdentifier>,
    /// Requested objects the sender only holds forward references to, with
    /// where their content lives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<(MeshObjectIdentifier, AccessPath)>,
    /// Full snapshots of objects being replicated to the receiver.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conveyed_objects: Vec<MeshObject>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pushed_home_replicas: Vec<MeshObjectIdentifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_home_replicas: Vec<MeshObjectIdentifier>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_lock_objects: Vec<MeshObjectIdentifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pushed_lock_objects: Vec<MeshObjectIdentifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reclaimed_lock_objects: Vec<MeshObjectIdentifier>,

    /// Changes in the order they were committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ChangeEvent>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cease_communications: bool,
}

impl XprisoMessage {
    pub fn new(sender: NetMeshBaseIdentifier, receiver: NetMeshBaseIdentifier) -> Self {
        Self {
            sender: Some(sender),
            receiver: Some(receiver),
            ..Self::default()
        }
    }

    /// Whether the message carries anything besides addressing and ids.
    pub fn is_empty(&self) -> bool {
        self.requested_first_time_objects.is_empty()
            && self.requested_canceled_objects.is_empty()
            && self.redirects.is_empty()
            && self.conveyed_objects.is_empty()
            && self.pushed_home_replicas.is_empty()
            && self.requested_home_replicas.is_empty()
            && self.requested_lock_objects.is_empty()
            && self.pushed_lock_objects.is_empty()
            && self.reclaimed_lock_objects.is_empty()
            && self.events.is_empty()
            && !self.cease_communications
    }

    /// Add a snapshot unless one for the same object is already conveyed.
    pub fn convey(&mut self, object: MeshObject) -> bool {
        if self.conveys(object.identifier()) {
            return false;
        }
        self.conveyed_objects.push(object);
        true
    }

    pub fn conveys(&self, identifier: &MeshObjectIdentifier) -> bool {
        self.conveyed_objects
            .iter()
            .any(|o| o.identifier() == identifier)
    }

    pub fn conveyed_identifiers(&self) -> BTreeSet<&MeshObjectIdentifier> {
        self.conveyed_objects.iter().map(|o| o.identifier()).collect()
    }

    pub fn type_additions(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::TypesAdded { .. }))
    }

    pub fn type_removals(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::TypesRemoved { .. }))
    }

    pub fn property_changes(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::PropertyChanged { .. }))
    }

    pub fn neighbor_additions(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::NeighborAdded { .. }))
    }

    pub fn neighbor_removals(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::NeighborRemoved { .. }))
    }

    pub fn role_additions(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::RolesAdded { .. }))
    }

    pub fn role_removals(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::RolesRemoved { .. }))
    }

    pub fn deletions(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ChangeEvent::Deleted { .. }))
    }
}

impl CarriesInvocationId for XprisoMessage {
    fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = Some(id);
    }

    fn response_id(&self) -> Option<u64> {
        self.response_id
    }

    fn set_response_id(&mut self, id: u64) {
        self.response_id = Some(id);
    }
}
