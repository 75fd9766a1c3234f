//! Mesh replication
//!
//! Keeps replicas of mesh objects in sync across mesh bases:
//! - `NetMeshBase`: a mesh base with proxies, a lock guard and forward references
//! - `Proxy`: the per-partner protocol state machine
//! - `ReplicaTable`: where each object's lock and home replica live
//! - `XprisoMessage`: the protocol message
//! - `MemoryMeshNetwork`: in-process endpoint factory

pub mod error;
pub mod meshbase;
pub mod message;
pub mod network;
pub mod policy;
pub mod proxy;
pub mod replica;

pub use error::{NetError, NetResult};
pub use meshbase::NetMeshBase;
pub use message::XprisoMessage;
pub use network::{link_in_memory, MemoryMeshNetwork, ProxyEndpointFactory};
pub use policy::ProxyPolicy;
pub use proxy::{Proxy, ProxyState};
pub use replica::{AccessPath, ReplicaState, ReplicaTable};
