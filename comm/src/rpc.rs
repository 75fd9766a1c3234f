//! Request/response correlation over an asynchronous endpoint.
//!
//! `call` stamps the outgoing message with a fresh invocation id, registers a
//! waiter under that id, and only then hands the message to the endpoint, so a
//! fast response can never miss its waiter. Incoming messages whose response
//! id matches a waiter complete that call; everything else goes to the
//! other-message handler.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    endpoint::MessageEndpoint,
    error::{CallError, EndpointError},
    listener::{MessageEndpointListener, Subscription},
    message::{CarriesInvocationId, InvocationIdGenerator, Message},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

type Waiter<T> = oneshot::Sender<Result<T, CallError>>;
type OtherMessageHandler<T> = Box<dyn Fn(&str, T) + Send + Sync>;

pub struct WaitForResponseEndpoint<T: Message + CarriesInvocationId> {
    endpoint: Arc<dyn MessageEndpoint<T>>,
    ids: Arc<InvocationIdGenerator>,
    pending: Mutex<HashMap<u64, Waiter<T>>>,
    default_timeout: Duration,
    other: RwLock<Option<OtherMessageHandler<T>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<T: Message + CarriesInvocationId> WaitForResponseEndpoint<T> {
    /// Wrap `endpoint`. The wrapper listens to the endpoint until it is dropped.
    pub fn new(
        endpoint: Arc<dyn MessageEndpoint<T>>,
        ids: Arc<InvocationIdGenerator>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let this = Self::unattached(Arc::clone(&endpoint), ids, default_timeout);
        let listener: Arc<dyn MessageEndpointListener<T>> = this.clone();
        let subscription = endpoint.add_weak_listener(&listener);
        *this.subscription.lock() = Some(subscription);
        this
    }

    /// Wrap `endpoint` without listening to it. The owner feeds incoming
    /// messages through `complete` and terminal errors through `fail_pending`.
    pub fn unattached(
        endpoint: Arc<dyn MessageEndpoint<T>>,
        ids: Arc<InvocationIdGenerator>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            ids,
            pending: Mutex::new(HashMap::new()),
            default_timeout,
            other: RwLock::new(None),
            subscription: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Arc<dyn MessageEndpoint<T>> {
        &self.endpoint
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Receives every incoming message that is not a response to a pending call.
    pub fn set_other_message_handler(&self, handler: impl Fn(&str, T) + Send + Sync + 'static) {
        *self.other.write() = Some(Box::new(handler));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn call(&self, message: T) -> Result<T, CallError> {
        self.call_with_timeout(message, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, mut message: T, timeout: Duration) -> Result<T, CallError> {
        let invocation_id = self.ids.next_id();
        message.set_request_id(invocation_id);

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(invocation_id, tx);
        // Dropping the call future must not leave the waiter behind.
        let _cleanup = scopeguard::guard((), |_| {
            self.pending.lock().remove(&invocation_id);
        });

        self.endpoint.enqueue_message_for_send(message)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::EndpointDisabled {
                invocation_id,
                reason: "waiter released without a result".to_string(),
            }),
            Err(_) => {
                let still_pending = self.pending.lock().remove(&invocation_id).is_some();
                let result_arrived = !still_pending && matches!(rx.try_recv(), Ok(Ok(_)));
                debug!(invocation_id, result_arrived, "Invocation timed out");
                Err(CallError::Timeout {
                    invocation_id,
                    result_arrived,
                })
            }
        }
    }

    /// Hand `message` to the call waiting for it. Returns the message back
    /// when it answers no pending call.
    pub fn complete(&self, message: T) -> Option<T> {
        let Some(response_id) = message.response_id() else {
            return Some(message);
        };
        let waiter = self.pending.lock().remove(&response_id);
        match waiter {
            Some(waiter) => {
                if waiter.send(Ok(message)).is_err() {
                    debug!(response_id, "Caller gave up before the response arrived");
                }
                None
            }
            None => {
                debug!(response_id, "Response matches no pending invocation");
                Some(message)
            }
        }
    }

    /// Release every pending call with `error`.
    pub fn fail_pending(&self, error: &EndpointError) {
        let waiters: Vec<(u64, Waiter<T>)> = self.pending.lock().drain().collect();
        if !waiters.is_empty() {
            warn!(
                endpoint = %self.endpoint.name(),
                count = waiters.len(),
                error = %error,
                "Failing pending invocations"
            );
        }
        for (invocation_id, waiter) in waiters {
            let _ = waiter.send(Err(CallError::EndpointDisabled {
                invocation_id,
                reason: error.to_string(),
            }));
        }
    }
}

impl<T: Message + CarriesInvocationId> MessageEndpointListener<T> for WaitForResponseEndpoint<T> {
    fn message_received(&self, endpoint: &str, message: T) {
        let Some(message) = self.complete(message) else {
            return;
        };
        match self.other.read().as_ref() {
            Some(handler) => handler(endpoint, message),
            None => debug!(endpoint, "No handler for incoming message, dropping"),
        }
    }

    fn disabling_error(&self, _endpoint: &str, _undelivered: &[T], error: &EndpointError) {
        self.fail_pending(error);
    }
}
