//! Mesh kernel
//!
//! The in-memory object graph every node holds a part of:
//! - Typed mesh objects with properties, relationships and equivalents
//! - Single-writer transactions producing one ChangeSet per commit
//! - Access-manager and mutation-guard checkpoints
//! - Store contract for persistence
//! - Scheduler contract and the Sweeper built on it

pub mod access;
pub mod error;
pub mod event;
pub mod identifier;
pub mod meshbase;
pub mod model;
pub mod object;
pub mod schedule;
pub mod store;
pub mod sweeper;
pub mod transaction;
pub mod value;

pub use access::{AccessManager, CallerContext, OwnerAccessManager, PermitAllAccessManager};
pub use error::{MeshError, MeshResult};
pub use event::{Change, ChangeEvent, ChangeSet};
pub use identifier::{MeshObjectIdentifier, NetMeshBaseIdentifier};
pub use meshbase::{ChangeSetListener, ListenerId, MeshBase, MeshBaseBuilder, MutationGuard};
pub use model::{
    DataType, EntityType, ModelBase, PropertyType, RelationshipType, RoleEnd, RoleType,
    TypeIdentifier,
};
pub use object::MeshObject;
pub use schedule::{ScheduledTask, Scheduler, TaskFuture, TokioScheduler};
pub use store::{MemoryStore, Store, StoreError, StoreResult, StoreValue};
pub use sweeper::{DefaultSweepPolicy, Purger, SweepDecision, SweepPolicy, SweepReport, Sweeper};
pub use transaction::Transaction;
pub use value::PropertyValue;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
