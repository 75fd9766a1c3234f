//! In-process link between two queued endpoints.
//!
//! Used for tests and for nodes that host several mesh bases in one process.
//! The `LinkControl` handle can make the link temporarily unreachable, which
//! the sending side sees as transient failures, or sever it for good.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::TransportError,
    message::Message,
    queued::{MessageTransport, QueuedMessageEndpoint},
    retry::RetryPolicy,
};

#[derive(Debug)]
struct LinkState {
    reachable: AtomicBool,
    severed: AtomicBool,
}

/// Switches for a memory link.
#[derive(Debug, Clone)]
pub struct LinkControl {
    state: Arc<LinkState>,
}

impl LinkControl {
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::SeqCst)
    }

    /// Permanently break the link in both directions.
    pub fn sever(&self) {
        self.state.severed.store(true, Ordering::SeqCst);
    }
}

struct MemoryTransport<T: Message> {
    peer: Mutex<Weak<QueuedMessageEndpoint<T>>>,
    link: Arc<LinkState>,
}

#[async_trait]
impl<T: Message> MessageTransport<T> for MemoryTransport<T> {
    async fn send(&self, message: T) -> Result<(), TransportError> {
        if self.link.severed.load(Ordering::SeqCst) {
            return Err(TransportError::Permanent("link severed".to_string()));
        }
        if !self.link.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Transient("partner unreachable".to_string()));
        }
        let peer = self.peer.lock().upgrade();
        match peer {
            Some(peer) => {
                peer.deliver(message);
                Ok(())
            }
            None => Err(TransportError::Permanent(
                "partner endpoint dropped".to_string(),
            )),
        }
    }
}

/// Create two endpoints wired to each other. Neither is started.
pub fn memory_pair<T: Message>(
    name_a: impl Into<String>,
    name_b: impl Into<String>,
    retry: RetryPolicy,
) -> (
    Arc<QueuedMessageEndpoint<T>>,
    Arc<QueuedMessageEndpoint<T>>,
    LinkControl,
) {
    let state = Arc::new(LinkState {
        reachable: AtomicBool::new(true),
        severed: AtomicBool::new(false),
    });
    let to_b = Arc::new(MemoryTransport::<T> {
        peer: Mutex::new(Weak::new()),
        link: Arc::clone(&state),
    });
    let to_a = Arc::new(MemoryTransport::<T> {
        peer: Mutex::new(Weak::new()),
        link: Arc::clone(&state),
    });

    let a = QueuedMessageEndpoint::new(name_a, to_b.clone(), retry.clone());
    let b = QueuedMessageEndpoint::new(name_b, to_a.clone(), retry);
    *to_b.peer.lock() = Arc::downgrade(&b);
    *to_a.peer.lock() = Arc::downgrade(&a);

    (a, b, LinkControl { state })
}
