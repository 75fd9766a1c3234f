use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

/// Anything that can travel through an endpoint.
pub trait Message: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> Message for T {}

/// Messages that can be correlated as request and response.
pub trait CarriesInvocationId {
    fn request_id(&self) -> Option<u64>;

    fn set_request_id(&mut self, id: u64);

    fn response_id(&self) -> Option<u64>;

    fn set_response_id(&mut self, id: u64);
}

/// Strictly increasing invocation ids.
///
/// Seeded from wall-clock microseconds, so ids stay unique across restarts as
/// long as fewer than a million calls per second are issued.
#[derive(Debug)]
pub struct InvocationIdGenerator {
    next: AtomicU64,
}

impl InvocationIdGenerator {
    pub fn new() -> Self {
        let seed = chrono::Utc::now().timestamp_micros().max(1) as u64;
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InvocationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
