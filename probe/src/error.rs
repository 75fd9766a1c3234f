//! Probe error types.

use mesh_kernel::{MeshError, NetMeshBaseIdentifier};
use mesh_net::NetError;
use thiserror::Error;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to fetch {source_id}: {reason}")]
    Fetch {
        source_id: NetMeshBaseIdentifier,
        reason: String,
    },

    #[error("{source_id} answered with HTTP status {status}")]
    HttpStatus {
        source_id: NetMeshBaseIdentifier,
        status: u16,
    },

    #[error("No fetcher for scheme '{scheme}' of {source_id}")]
    UnsupportedScheme {
        source_id: NetMeshBaseIdentifier,
        scheme: String,
    },

    #[error("No probe for {source_id} (content type {content_type:?})")]
    NoProbe {
        source_id: NetMeshBaseIdentifier,
        content_type: Option<String>,
    },

    #[error("Malformed content from {source_id}: {reason}")]
    Malformed {
        source_id: NetMeshBaseIdentifier,
        reason: String,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Invalid probe pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid coherence specification: {0}")]
    InvalidCoherence(String),

    #[error("Probe manager is stopped")]
    Stopped,

    #[error("No shadow for {0}")]
    UnknownShadow(NetMeshBaseIdentifier),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Net(#[from] NetError),
}

impl ProbeError {
    pub fn malformed(source_id: &NetMeshBaseIdentifier, reason: impl Into<String>) -> Self {
        Self::Malformed {
            source_id: source_id.clone(),
            reason: reason.into(),
        }
    }

    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Fetch { .. } => false,
            Self::HttpStatus { status, .. } => *status < 500 && *status != 429,
            _ => true,
        }
    }
}
