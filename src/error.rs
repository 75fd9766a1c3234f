//! Node error types.

use mesh_kernel::MeshError;
use mesh_net::NetError;
use mesh_probe::ProbeError;
use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Failed to read configuration {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}
