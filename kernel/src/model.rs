//! Minimal model registry: entity types, property types and relationship
//! types with their two role types.
//!
//! Only what blessing and property rules need is kept here. A `ModelBase` is
//! built once at start-up and shared immutably.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{MeshError, MeshResult},
    value::PropertyValue,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeIdentifier(String);

impl TypeIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeIdentifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for TypeIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    Blob,
    TimeStamp,
    Enumerated(Vec<String>),
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enumerated(domain) => write!(f, "Enumerated{domain:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyType {
    pub id: TypeIdentifier,
    pub data_type: DataType,
    pub optional: bool,
    pub default: Option<PropertyValue>,
}

impl PropertyType {
    pub fn new(id: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: TypeIdentifier::new(id),
            data_type,
            optional: true,
            default: None,
        }
    }

    /// Make the property mandatory, initialized to `default` on blessing.
    pub fn mandatory(mut self, default: PropertyValue) -> Self {
        self.optional = false;
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub id: TypeIdentifier,
    pub is_abstract: bool,
    pub supertypes: Vec<TypeIdentifier>,
    pub property_types: Vec<PropertyType>,
}

impl EntityType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TypeIdentifier::new(id),
            is_abstract: false,
            supertypes: Vec::new(),
            property_types: Vec::new(),
        }
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn with_supertype(mut self, supertype: impl Into<String>) -> Self {
        self.supertypes.push(TypeIdentifier::new(supertype));
        self
    }

    pub fn with_property(mut self, property: PropertyType) -> Self {
        self.property_types.push(property);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEnd {
    Source,
    Destination,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleType {
    pub id: TypeIdentifier,
    pub relationship: TypeIdentifier,
    pub end: RoleEnd,
    /// Entity type the object playing this role must be blessed with.
    pub entity_type: Option<TypeIdentifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipType {
    pub id: TypeIdentifier,
    pub source: RoleType,
    pub destination: RoleType,
}

impl RelationshipType {
    /// Source role is `<id>-S`, destination role `<id>-D`.
    pub fn new(id: impl Into<String>, source: Option<&str>, destination: Option<&str>) -> Self {
        let id = TypeIdentifier::new(id);
        let role = |suffix: &str, end, entity: Option<&str>| RoleType {
            id: TypeIdentifier::new(format!("{}-{suffix}", id.as_str())),
            relationship: id.clone(),
            end,
            entity_type: entity.map(TypeIdentifier::from),
        };
        Self {
            source: role("S", RoleEnd::Source, source),
            destination: role("D", RoleEnd::Destination, destination),
            id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelBase {
    entity_types: HashMap<TypeIdentifier, EntityType>,
    relationship_types: HashMap<TypeIdentifier, RelationshipType>,
    role_types: HashMap<TypeIdentifier, RoleType>,
}

impl ModelBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_types.insert(entity_type.id.clone(), entity_type);
        self
    }

    pub fn with_relationship_type(mut self, relationship: RelationshipType) -> Self {
        self.role_types
            .insert(relationship.source.id.clone(), relationship.source.clone());
        self.role_types.insert(
            relationship.destination.id.clone(),
            relationship.destination.clone(),
        );
        self.relationship_types
            .insert(relationship.id.clone(), relationship);
        self
    }

    /// Union of two models; types in `other` replace same-named types here.
    pub fn merge(mut self, other: ModelBase) -> Self {
        self.entity_types.extend(other.entity_types);
        self.relationship_types.extend(other.relationship_types);
        self.role_types.extend(other.role_types);
        self
    }

    pub fn entity_type(&self, id: &TypeIdentifier) -> MeshResult<&EntityType> {
        self.entity_types
            .get(id)
            .ok_or_else(|| MeshError::UnknownType(id.to_string()))
    }

    pub fn role_type(&self, id: &TypeIdentifier) -> MeshResult<&RoleType> {
        self.role_types
            .get(id)
            .ok_or_else(|| MeshError::UnknownType(id.to_string()))
    }

    pub fn relationship_type(&self, id: &TypeIdentifier) -> MeshResult<&RelationshipType> {
        self.relationship_types
            .get(id)
            .ok_or_else(|| MeshError::UnknownType(id.to_string()))
    }

    /// The role played by the other end of the same relationship.
    pub fn inverse_role(&self, role: &TypeIdentifier) -> MeshResult<&RoleType> {
        let role = self.role_type(role)?;
        let relationship = self.relationship_type(&role.relationship)?;
        Ok(match role.end {
            RoleEnd::Source => &relationship.destination,
            RoleEnd::Destination => &relationship.source,
        })
    }

    pub fn is_subtype_of(&self, sub: &TypeIdentifier, sup: &TypeIdentifier) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![sub];
        while let Some(current) = pending.pop() {
            if current == sup {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(et) = self.entity_types.get(current) {
                pending.extend(et.supertypes.iter());
            }
        }
        false
    }

    /// Whether any of `types` is, or inherits from, `required`.
    pub fn satisfies(&self, types: &BTreeSet<TypeIdentifier>, required: &TypeIdentifier) -> bool {
        types.iter().any(|t| self.is_subtype_of(t, required))
    }

    /// Property types of an entity type, including inherited ones.
    pub fn property_types_of(&self, entity: &TypeIdentifier) -> Vec<&PropertyType> {
        let mut seen = HashSet::new();
        let mut pending = vec![entity];
        let mut out = Vec::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(et) = self.entity_types.get(current) {
                out.extend(et.property_types.iter());
                pending.extend(et.supertypes.iter());
            }
        }
        out
    }

    /// Finds the property type among those carried by `types`.
    pub fn property_type_for(
        &self,
        types: &BTreeSet<TypeIdentifier>,
        property: &TypeIdentifier,
    ) -> Option<&PropertyType> {
        types
            .iter()
            .flat_map(|t| self.property_types_of(t))
            .find(|pt| &pt.id == property)
    }
}
