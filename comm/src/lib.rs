//! Mesh communication
//!
//! Message endpoints between mesh bases:
//! - `MessageEndpoint`: ordered, best-effort channel with listener subscriptions
//! - `QueuedMessageEndpoint`: send queue with retry and a terminal disabling error
//! - `memory_pair`: in-process transport with a reachability switch
//! - `WaitForResponseEndpoint`: correlated request/response calls with timeouts

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod queued;
pub mod retry;
pub mod rpc;

pub use endpoint::MessageEndpoint;
pub use error::{CallError, EndpointError, TransportError};
pub use listener::{ListenerSet, MessageEndpointListener, Subscription};
pub use memory::{memory_pair, LinkControl};
pub use message::{CarriesInvocationId, InvocationIdGenerator, Message};
pub use metrics::{EndpointMetrics, EndpointMetricsSnapshot};
pub use queued::{MessageTransport, QueuedMessageEndpoint};
pub use retry::{BackoffKind, RetryPolicy};
pub use rpc::{WaitForResponseEndpoint, DEFAULT_CALL_TIMEOUT};
