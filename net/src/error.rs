//! Replication error types.

use mesh_comm::{CallError, EndpointError};
use mesh_kernel::{MeshError, MeshObjectIdentifier, NetMeshBaseIdentifier};
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("No endpoint factory configured to reach {0}")]
    NoEndpointFactory(NetMeshBaseIdentifier),

    #[error("Cannot reach {partner}: {reason}")]
    Unreachable {
        partner: NetMeshBaseIdentifier,
        reason: String,
    },

    #[error("Proxy towards {0} is not communicating")]
    NotCommunicating(NetMeshBaseIdentifier),

    #[error("{partner} did not provide {identifier}")]
    NotAvailable {
        partner: NetMeshBaseIdentifier,
        identifier: MeshObjectIdentifier,
    },

    #[error("{0} is not a forward reference and has no partner to obtain it from")]
    NoAccessPath(MeshObjectIdentifier),

    #[error("Only the home replica may reclaim the lock of {0}")]
    NotHomeReplica(MeshObjectIdentifier),

    #[error("Mesh base {0} has been shut down")]
    Dead(NetMeshBaseIdentifier),
}

impl NetError {
    /// A mutation refused by the access manager or for lack of the lock.
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, Self::Mesh(e) if e.is_permission_error())
    }
}
