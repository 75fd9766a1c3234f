use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{identifier::MeshObjectIdentifier, model::TypeIdentifier, value::PropertyValue};

/// A node in the object graph.
///
/// Values handed out by a `MeshBase` are snapshots; mutation goes through a
/// `Transaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    pub(crate) identifier: MeshObjectIdentifier,
    pub(crate) types: BTreeSet<TypeIdentifier>,
    pub(crate) properties: BTreeMap<TypeIdentifier, PropertyValue>,
    /// Neighbor -> role types this object plays towards that neighbor.
    pub(crate) neighbors: BTreeMap<MeshObjectIdentifier, BTreeSet<TypeIdentifier>>,
    pub(crate) equivalents: BTreeSet<MeshObjectIdentifier>,
    pub(crate) owner: Option<MeshObjectIdentifier>,
    pub(crate) time_created: i64,
    pub(crate) time_updated: i64,
    pub(crate) time_read: i64,
    pub(crate) time_expires: Option<i64>,
}

impl MeshObject {
    pub(crate) fn new(identifier: MeshObjectIdentifier, now: i64) -> Self {
        Self {
            identifier,
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            equivalents: BTreeSet::new(),
            owner: None,
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
        }
    }

    /// A content-free stand-in for an object whose state lives elsewhere.
    pub fn stub(identifier: MeshObjectIdentifier, now: i64) -> Self {
        Self::new(identifier, now)
    }

    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.identifier
    }

    pub fn types(&self) -> &BTreeSet<TypeIdentifier> {
        &self.types
    }

    /// Direct blessing check, without consulting the type hierarchy.
    pub fn is_blessed_by(&self, entity_type: &TypeIdentifier) -> bool {
        self.types.contains(entity_type)
    }

    pub fn property(&self, property: &TypeIdentifier) -> Option<&PropertyValue> {
        self.properties.get(property)
    }

    pub fn properties(&self) -> &BTreeMap<TypeIdentifier, PropertyValue> {
        &self.properties
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &MeshObjectIdentifier> {
        self.neighbors.keys()
    }

    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.neighbors.contains_key(neighbor)
    }

    /// Roles this object plays towards `neighbor`.
    pub fn roles_towards(&self, neighbor: &MeshObjectIdentifier) -> Option<&BTreeSet<TypeIdentifier>> {
        self.neighbors.get(neighbor)
    }

    /// Neighbors reached by playing `role`.
    pub fn neighbors_by_role(&self, role: &TypeIdentifier) -> Vec<&MeshObjectIdentifier> {
        self.neighbors
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn equivalents(&self) -> &BTreeSet<MeshObjectIdentifier> {
        &self.equivalents
    }

    pub fn owner(&self) -> Option<&MeshObjectIdentifier> {
        self.owner.as_ref()
    }

    pub fn time_created(&self) -> i64 {
        self.time_created
    }

    pub fn time_updated(&self) -> i64 {
        self.time_updated
    }

    pub fn time_read(&self) -> i64 {
        self.time_read
    }

    pub fn time_expires(&self) -> Option<i64> {
        self.time_expires
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.time_expires.is_some_and(|t| t <= now)
    }

    /// Whether two snapshots carry the same graph content, ignoring timestamps.
    pub fn same_content(&self, other: &MeshObject) -> bool {
        self.identifier == other.identifier
            && self.types == other.types
            && self.properties == other.properties
            && self.neighbors == other.neighbors
            && self.equivalents == other.equivalents
    }

    /// Copy without relationships or equivalents, for instantiating a replica
    /// before its neighbors are linked.
    pub fn detached(&self) -> MeshObject {
        MeshObject {
            neighbors: BTreeMap::new(),
            equivalents: BTreeSet::new(),
            ..self.clone()
        }
    }

    pub(crate) fn touch_updated(&mut self, now: i64) {
        self.time_updated = self.time_updated.max(now);
    }
}
