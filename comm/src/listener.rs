//! Endpoint listeners and the subscriptions that scope them.
//!
//! Registering a listener returns a `Subscription`. Dropping the subscription
//! unregisters the listener; `Subscription::forget` keeps it for the life of
//! the endpoint. Weakly held listeners also disappear once their last strong
//! reference is gone.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;

use crate::{error::EndpointError, message::Message};

pub trait MessageEndpointListener<T: Message>: Send + Sync {
    fn message_received(&self, endpoint: &str, message: T);

    fn message_sent(&self, _endpoint: &str, _message: &T) {}

    fn message_enqueued(&self, _endpoint: &str, _message: &T) {}

    fn message_sending_failed(&self, _endpoint: &str, _message: &T, _error: &str) {}

    /// The endpoint is terminal. `undelivered` are the messages still queued.
    fn disabling_error(&self, _endpoint: &str, _undelivered: &[T], _error: &EndpointError) {}
}

enum ListenerRef<T: Message> {
    Strong(Arc<dyn MessageEndpointListener<T>>),
    Weak(Weak<dyn MessageEndpointListener<T>>),
}

type Entries<T> = Mutex<Vec<(u64, ListenerRef<T>)>>;

pub struct ListenerSet<T: Message> {
    next_id: AtomicU64,
    entries: Arc<Entries<T>>,
}

impl<T: Message> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Message> ListenerSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MessageEndpointListener<T>>) -> Subscription {
        self.insert(ListenerRef::Strong(listener))
    }

    pub fn add_weak(&self, listener: &Arc<dyn MessageEndpointListener<T>>) -> Subscription {
        self.insert(ListenerRef::Weak(Arc::downgrade(listener)))
    }

    fn insert(&self, listener: ListenerRef<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        let entries: Weak<Entries<T>> = Arc::downgrade(&self.entries);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries.lock().retain(|(eid, _)| *eid != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every live listener, outside the registry lock.
    pub fn fire(&self, f: impl Fn(&dyn MessageEndpointListener<T>)) {
        let live: Vec<Arc<dyn MessageEndpointListener<T>>> = {
            let mut entries = self.entries.lock();
            entries.retain(|(_, l)| match l {
                ListenerRef::Strong(_) => true,
                ListenerRef::Weak(w) => w.strong_count() > 0,
            });
            entries
                .iter()
                .filter_map(|(_, l)| match l {
                    ListenerRef::Strong(s) => Some(Arc::clone(s)),
                    ListenerRef::Weak(w) => w.upgrade(),
                })
                .collect()
        };
        for listener in live {
            f(listener.as_ref());
        }
    }
}

/// Keeps a listener registered until dropped.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keep the listener registered for the lifetime of the endpoint.
    pub fn forget(mut self) {
        self.remove.take();
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
