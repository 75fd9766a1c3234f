//! infomesh node
//!
//! Ties the mesh crates together into a runnable node:
//! - `config`: YAML node configuration
//! - `node`: local mesh base, shadow manager and sweeper wiring
//! - `logging`: subscriber setup for the binary

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use config::{FetchConfig, NodeConfig, StoreKind, SweeperConfig};
pub use error::{NodeError, NodeResult};
pub use node::Node;
