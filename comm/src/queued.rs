//! Queued message endpoint.
//!
//! Outgoing messages go into a FIFO queue drained by a background send loop.
//! A message leaves the queue only after the transport accepted it. Transient
//! failures are retried per `RetryPolicy`; once the budget is exhausted, or the
//! transport reports a permanent failure, the endpoint turns dead, reports the
//! undelivered queue through `disabling_error` exactly once, and refuses any
//! further messages.
//!
//! Incoming messages are handed to `deliver`, buffered, and dispatched to
//! listeners in arrival order by a receive loop.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    endpoint::MessageEndpoint,
    error::{EndpointError, TransportError},
    listener::{ListenerSet, MessageEndpointListener, Subscription},
    message::Message,
    metrics::{EndpointMetrics, EndpointMetricsSnapshot},
    retry::RetryPolicy,
};

/// Moves a single message to the partner.
#[async_trait]
pub trait MessageTransport<T: Message>: Send + Sync {
    async fn send(&self, message: T) -> Result<(), TransportError>;
}

enum Progress {
    Sent,
    Empty,
    Stopped,
}

pub struct QueuedMessageEndpoint<T: Message> {
    name: String,
    transport: Arc<dyn MessageTransport<T>>,
    retry: RetryPolicy,
    queue: Mutex<VecDeque<T>>,
    dead: AtomicBool,
    started: AtomicBool,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    inbound_tx: mpsc::UnboundedSender<T>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    listeners: ListenerSet<T>,
    metrics: EndpointMetrics,
}

impl<T: Message> QueuedMessageEndpoint<T> {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn MessageTransport<T>>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            transport,
            retry,
            queue: Mutex::new(VecDeque::new()),
            dead: AtomicBool::new(false),
            started: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            listeners: ListenerSet::new(),
            metrics: EndpointMetrics::new(),
        })
    }

    /// Spawn the send and receive loops. Must be called within a tokio runtime.
    pub fn start_communicating(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inbound) = self.inbound_rx.lock().take() else {
            return;
        };
        debug!(endpoint = %self.name, "Starting endpoint");
        tokio::spawn(Self::send_loop(
            Arc::downgrade(self),
            Arc::clone(&self.wake),
            self.shutdown.clone(),
        ));
        tokio::spawn(Self::receive_loop(
            Arc::downgrade(self),
            inbound,
            self.shutdown.clone(),
        ));
    }

    /// Hand an incoming message to this endpoint.
    pub fn deliver(&self, message: T) {
        if self.inbound_tx.send(message).is_err() {
            debug!(endpoint = %self.name, "Dropping incoming message, receive loop has ended");
        }
    }

    pub fn metrics(&self) -> EndpointMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn send_loop(weak: Weak<Self>, wake: Arc<Notify>, shutdown: CancellationToken) {
        loop {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let Some(endpoint) = weak.upgrade() else {
                    return;
                };
                match endpoint.send_front().await {
                    Progress::Sent => continue,
                    Progress::Empty => break,
                    Progress::Stopped => return,
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = wake.notified() => {}
            }
        }
    }

    async fn receive_loop(
        weak: Weak<Self>,
        mut inbound: mpsc::UnboundedReceiver<T>,
        shutdown: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = inbound.recv() => match next {
                    Some(message) => message,
                    None => return,
                },
            };
            let Some(endpoint) = weak.upgrade() else {
                return;
            };
            endpoint.metrics.record_received();
            endpoint
                .listeners
                .fire(|l| l.message_received(&endpoint.name, message.clone()));
        }
    }

    /// Try to deliver the oldest queued message, retrying as configured.
    async fn send_front(&self) -> Progress {
        let mut attempt: u32 = 0;
        loop {
            if self.is_dead() {
                return Progress::Stopped;
            }
            let Some(message) = self.queue.lock().front().cloned() else {
                return Progress::Empty;
            };

            let reason = match self.transport.send(message.clone()).await {
                Ok(()) => {
                    self.queue.lock().pop_front();
                    self.metrics.record_sent();
                    self.listeners.fire(|l| l.message_sent(&self.name, &message));
                    return Progress::Sent;
                }
                Err(TransportError::Permanent(reason)) => {
                    self.metrics.record_send_failure();
                    self.listeners
                        .fire(|l| l.message_sending_failed(&self.name, &message, &reason));
                    self.go_dead(EndpointError::PartnerGone {
                        endpoint: self.name.clone(),
                        reason,
                    });
                    return Progress::Stopped;
                }
                Err(TransportError::Transient(reason)) => reason,
            };

            self.metrics.record_send_failure();
            self.listeners
                .fire(|l| l.message_sending_failed(&self.name, &message, &reason));
            attempt += 1;
            if attempt > self.retry.max_retries {
                self.go_dead(EndpointError::RetriesExhausted {
                    endpoint: self.name.clone(),
                    attempts: attempt,
                    last_error: reason,
                });
                return Progress::Stopped;
            }
            let delay = self.retry.delay_for(attempt);
            debug!(
                endpoint = %self.name,
                attempt,
                ?delay,
                error = %reason,
                "Send failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Progress::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn go_dead(&self, error: EndpointError) {
        let undelivered: Vec<T> = {
            let mut queue = self.queue.lock();
            if self.dead.swap(true, Ordering::SeqCst) {
                return;
            }
            queue.drain(..).collect()
        };
        warn!(
            endpoint = %self.name,
            undelivered = undelivered.len(),
            error = %error,
            "Endpoint disabled"
        );
        self.metrics.record_disabled();
        self.listeners
            .fire(|l| l.disabling_error(&self.name, &undelivered, &error));
    }
}

impl<T: Message> MessageEndpoint<T> for QueuedMessageEndpoint<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue_message_for_send(&self, message: T) -> Result<(), EndpointError> {
        {
            let mut queue = self.queue.lock();
            if self.dead.load(Ordering::SeqCst) {
                return Err(EndpointError::Dead(self.name.clone()));
            }
            queue.push_back(message.clone());
        }
        self.metrics.record_enqueued();
        self.listeners
            .fire(|l| l.message_enqueued(&self.name, &message));
        self.wake.notify_one();
        Ok(())
    }

    fn messages_to_be_sent(&self) -> Vec<T> {
        self.queue.lock().iter().cloned().collect()
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: Arc<dyn MessageEndpointListener<T>>) -> Subscription {
        self.listeners.add(listener)
    }

    fn add_weak_listener(&self, listener: &Arc<dyn MessageEndpointListener<T>>) -> Subscription {
        self.listeners.add_weak(listener)
    }

    fn stop_communicating(&self) {
        if !self.shutdown.is_cancelled() {
            info!(endpoint = %self.name, "Stopping endpoint");
            self.shutdown.cancel();
        }
    }
}

impl<T: Message> Drop for QueuedMessageEndpoint<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
