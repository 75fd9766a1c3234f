use std::sync::Arc;

use crate::{
    error::EndpointError,
    listener::{MessageEndpointListener, Subscription},
    message::Message,
};

/// Bidirectional, ordered, best-effort message channel to a single partner.
pub trait MessageEndpoint<T: Message>: Send + Sync {
    fn name(&self) -> &str;

    /// Queue `message` for sending. Never blocks; fails once the endpoint is dead.
    fn enqueue_message_for_send(&self, message: T) -> Result<(), EndpointError>;

    /// Messages queued but not yet delivered, oldest first.
    fn messages_to_be_sent(&self) -> Vec<T>;

    fn is_dead(&self) -> bool;

    fn add_listener(&self, listener: Arc<dyn MessageEndpointListener<T>>) -> Subscription;

    fn add_weak_listener(&self, listener: &Arc<dyn MessageEndpointListener<T>>) -> Subscription;

    /// Stop background processing. Queued messages are kept but not sent.
    fn stop_communicating(&self);
}
