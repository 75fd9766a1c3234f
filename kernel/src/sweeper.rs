//! Background expiry and eviction of mesh objects.
//!
//! Each run visits every object, asks the policy what to do with it and then
//! schedules its own successor, so a slow run never overlaps the next one.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::MeshResult,
    identifier::MeshObjectIdentifier,
    meshbase::MeshBase,
    object::MeshObject,
    schedule::{ScheduledTask, Scheduler},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    Keep,
    Delete,
    /// Drop replica content, keeping a stub that can be resolved again.
    Purge,
}

pub trait SweepPolicy: Send + Sync {
    fn decide(&self, object: &MeshObject, now: i64) -> SweepDecision;
}

/// Drops replica content while keeping the object addressable.
pub trait Purger: Send + Sync {
    /// Returns how many of `candidates` were actually purged.
    fn purge(&self, candidates: &[MeshObjectIdentifier]) -> MeshResult<usize>;
}

/// Deletes expired objects and optionally purges objects not read for a while.
#[derive(Debug, Clone, Default)]
pub struct DefaultSweepPolicy {
    pub purge_unread_after: Option<Duration>,
}

impl SweepPolicy for DefaultSweepPolicy {
    fn decide(&self, object: &MeshObject, now: i64) -> SweepDecision {
        if object.is_expired(now) {
            return SweepDecision::Delete;
        }
        match self.purge_unread_after {
            Some(idle) if now - object.time_read() >= idle.as_millis() as i64 => SweepDecision::Purge,
            _ => SweepDecision::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    pub purged: usize,
}

pub struct Sweeper {
    base: Arc<MeshBase>,
    policy: Arc<dyn SweepPolicy>,
    scheduler: Arc<dyn Scheduler>,
    purger: Option<Arc<dyn Purger>>,
    interval: Duration,
    stopped: AtomicBool,
    next_run: Mutex<Option<ScheduledTask>>,
}

impl Sweeper {
    pub fn new(
        base: Arc<MeshBase>,
        policy: Arc<dyn SweepPolicy>,
        scheduler: Arc<dyn Scheduler>,
        interval: Duration,
    ) -> Self {
        Self {
            base,
            policy,
            scheduler,
            purger: None,
            interval,
            stopped: AtomicBool::new(true),
            next_run: Mutex::new(None),
        }
    }

    pub fn with_purger(mut self, purger: Arc<dyn Purger>) -> Self {
        self.purger = Some(purger);
        self
    }

    /// Visit every object once.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.base.current_time();
        let objects = self.base.objects();
        let mut report = SweepReport {
            examined: objects.len(),
            ..SweepReport::default()
        };

        let mut to_delete = Vec::new();
        let mut to_purge = Vec::new();
        for object in &objects {
            match self.policy.decide(object, now) {
                SweepDecision::Keep => {}
                SweepDecision::Delete => to_delete.push(object.identifier().clone()),
                SweepDecision::Purge => to_purge.push(object.identifier().clone()),
            }
        }

        if !to_delete.is_empty() {
            let mut tx = self.base.begin_transaction();
            tx.with_sudo(|tx| {
                for id in &to_delete {
                    // a neighbor deleted earlier in this run may already be gone
                    if !tx.contains(id) {
                        continue;
                    }
                    match tx.delete(id) {
                        Ok(()) => report.deleted += 1,
                        Err(e) => warn!(object = %id, error = %e, "Sweeper could not delete object"),
                    }
                }
            });
            tx.commit();
        }

        if !to_purge.is_empty() {
            match &self.purger {
                Some(purger) => match purger.purge(&to_purge) {
                    Ok(n) => report.purged = n,
                    Err(e) => warn!(error = %e, "Sweeper purge failed"),
                },
                None => debug!(
                    candidates = to_purge.len(),
                    "No purger configured, skipping purge"
                ),
            }
        }

        if report.deleted > 0 || report.purged > 0 {
            info!(
                base = %self.base.identifier(),
                examined = report.examined,
                deleted = report.deleted,
                purged = report.purged,
                "Sweep completed"
            );
        }
        report
    }

    /// Start sweeping; the first run happens after one interval.
    pub fn start(self: &Arc<Self>) {
        if self.stopped.swap(false, Ordering::SeqCst) {
            info!(base = %self.base.identifier(), interval = ?self.interval, "Starting sweeper");
            self.schedule_next();
        }
    }

    /// Stop scheduling runs. A run already in progress completes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.next_run.lock().take() {
            task.cancel();
        }
        info!(base = %self.base.identifier(), "Sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn schedule_next(self: &Arc<Self>) {
        let sweeper = Arc::clone(self);
        let task = self.scheduler.schedule(
            self.interval,
            Box::pin(async move {
                sweeper.run_and_reschedule();
            }),
        );
        let mut next_run = self.next_run.lock();
        if self.stopped.load(Ordering::SeqCst) {
            task.cancel();
        } else {
            *next_run = Some(task);
        }
    }

    fn run_and_reschedule(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.sweep_once();
        if !self.stopped.load(Ordering::SeqCst) {
            self.schedule_next();
        }
    }
}
