//! Change events and the per-transaction ChangeSet.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    identifier::{MeshObjectIdentifier, NetMeshBaseIdentifier},
    model::TypeIdentifier,
    object::MeshObject,
    value::PropertyValue,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created {
        object: MeshObject,
    },
    /// Carries the last state of the object.
    Deleted {
        object: MeshObject,
    },
    TypesAdded {
        identifier: MeshObjectIdentifier,
        types: Vec<TypeIdentifier>,
    },
    TypesRemoved {
        identifier: MeshObjectIdentifier,
        types: Vec<TypeIdentifier>,
    },
    PropertyChanged {
        identifier: MeshObjectIdentifier,
        property: TypeIdentifier,
        old: Option<PropertyValue>,
        new: Option<PropertyValue>,
    },
    NeighborAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    NeighborRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    /// `roles` are played by `identifier`; the neighbor plays the inverses.
    RolesAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<TypeIdentifier>,
    },
    RolesRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<TypeIdentifier>,
    },
    EquivalentAdded {
        identifier: MeshObjectIdentifier,
        equivalent: MeshObjectIdentifier,
    },
    EquivalentRemoved {
        identifier: MeshObjectIdentifier,
        equivalent: MeshObjectIdentifier,
    },
}

impl ChangeEvent {
    /// The object the event is primarily about.
    pub fn affected(&self) -> &MeshObjectIdentifier {
        match self {
            Self::Created { object } | Self::Deleted { object } => &object.identifier,
            Self::TypesAdded { identifier, .. }
            | Self::TypesRemoved { identifier, .. }
            | Self::PropertyChanged { identifier, .. }
            | Self::NeighborAdded { identifier, .. }
            | Self::NeighborRemoved { identifier, .. }
            | Self::RolesAdded { identifier, .. }
            | Self::RolesRemoved { identifier, .. }
            | Self::EquivalentAdded { identifier, .. }
            | Self::EquivalentRemoved { identifier, .. } => identifier,
        }
    }

    /// The other object touched by relationship and equivalence events.
    pub fn counterpart(&self) -> Option<&MeshObjectIdentifier> {
        match self {
            Self::NeighborAdded { neighbor, .. }
            | Self::NeighborRemoved { neighbor, .. }
            | Self::RolesAdded { neighbor, .. }
            | Self::RolesRemoved { neighbor, .. } => Some(neighbor),
            Self::EquivalentAdded { equivalent, .. } | Self::EquivalentRemoved { equivalent, .. } => {
                Some(equivalent)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Deleted { .. } => "deleted",
            Self::TypesAdded { .. } => "types_added",
            Self::TypesRemoved { .. } => "types_removed",
            Self::PropertyChanged { .. } => "property_changed",
            Self::NeighborAdded { .. } => "neighbor_added",
            Self::NeighborRemoved { .. } => "neighbor_removed",
            Self::RolesAdded { .. } => "roles_added",
            Self::RolesRemoved { .. } => "roles_removed",
            Self::EquivalentAdded { .. } => "equivalent_added",
            Self::EquivalentRemoved { .. } => "equivalent_removed",
        }
    }
}

/// One event plus where and when it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub event: ChangeEvent,
    /// Mesh base the change was received from; `None` for local changes.
    pub origin: Option<NetMeshBaseIdentifier>,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    pub fn affected_identifiers(&self) -> BTreeSet<&MeshObjectIdentifier> {
        self.changes.iter().map(|c| c.event.affected()).collect()
    }

    /// Changes that did not come from `partner`.
    pub fn not_from<'a>(
        &'a self,
        partner: &'a NetMeshBaseIdentifier,
    ) -> impl Iterator<Item = &'a Change> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.origin.as_ref() != Some(partner))
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
