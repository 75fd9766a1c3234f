//! "Run this after N milliseconds" facility used by the sweeper and the
//! probe manager.

use std::{future::Future, pin::Pin, time::Duration};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: TaskFuture) -> ScheduledTask;
}

/// Handle to a scheduled run.
///
/// Cancelling prevents a pending run from starting; a run that has already
/// started finishes normally.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    shutdown: CancellationToken,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shutdown: CancellationToken::new(),
        }
    }

    /// Scheduler on the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Cancel every pending run scheduled through this scheduler.
    pub fn shutdown(&self) {
        debug!("Scheduler shutting down");
        self.shutdown.cancel();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TaskFuture) -> ScheduledTask {
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // no longer cancellable once started
                    task.await;
                }
            }
        });
        ScheduledTask { token }
    }
}
