//! Kernel error types.
//!
//! Identity conflicts, permission failures and type-rule violations raised by
//! mesh objects, mesh bases, transactions and stores.

use thiserror::Error;

use crate::store::StoreError;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("MeshObject with identifier already exists: {0}")]
    IdentifierNotUnique(String),

    #[error("MeshObject not found: {0}")]
    NotFound(String),

    #[error("Not permitted to {operation} on {identifier}: {reason}")]
    NotPermitted {
        operation: &'static str,
        identifier: String,
        reason: String,
    },

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Cannot bless with abstract entity type: {0}")]
    EntityTypeAbstract(String),

    #[error("{identifier} is already blessed with {entity_type}")]
    BlessedAlready {
        identifier: String,
        entity_type: String,
    },

    #[error("{identifier} is not blessed with {entity_type}")]
    NotBlessed {
        identifier: String,
        entity_type: String,
    },

    #[error("Cannot unbless {identifier} from {entity_type}: still required by role {role}")]
    RoleRequiresEntityType {
        identifier: String,
        entity_type: String,
        role: String,
    },

    #[error("Property {property} is not carried by any type of {identifier}")]
    IllegalProperty {
        identifier: String,
        property: String,
    },

    #[error("Value for property {property} does not conform to {expected}")]
    IllegalPropertyValue { property: String, expected: String },

    #[error("Mandatory property {property} of {identifier} cannot be empty")]
    MandatoryProperty {
        identifier: String,
        property: String,
    },

    #[error("{identifier} and {neighbor} are already related")]
    RelatedAlready { identifier: String, neighbor: String },

    #[error("{identifier} and {neighbor} are not related")]
    NotRelated { identifier: String, neighbor: String },

    #[error("Cannot relate {0} to itself")]
    CannotRelateToItself(String),

    #[error("Relationship {identifier} -> {neighbor} is already blessed with role {role}")]
    RoleBlessedAlready {
        identifier: String,
        neighbor: String,
        role: String,
    },

    #[error("Relationship {identifier} -> {neighbor} is not blessed with role {role}")]
    RoleNotBlessed {
        identifier: String,
        neighbor: String,
        role: String,
    },

    #[error("Role {role} requires {identifier} to be blessed with {entity_type}")]
    IncompatibleRole {
        identifier: String,
        role: String,
        entity_type: String,
    },

    #[error("Invalid network identifier '{raw}': {reason}")]
    InvalidIdentifier { raw: String, reason: String },

    #[error("Cannot encode or decode {identifier}: {reason}")]
    Encoding { identifier: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MeshError {
    pub fn not_permitted(
        operation: &'static str,
        identifier: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::NotPermitted {
            operation,
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from the access manager or the lock guard.
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::NotPermitted { .. })
    }
}
