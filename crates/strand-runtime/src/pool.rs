//! Worker pool: N dispatcher loops on tokio blocking threads.
//!
//! Steps are synchronous and may block on I/O, so every `poll_once` runs in
//! `spawn_blocking`. A loop sleeps `poll_interval` when a poll claimed nothing
//! and stops cooperatively once the shutdown channel flips to `true`; a strand
//! that is mid-run finishes its current pass first.
//!
//! While the loops run, the pool supervises the dispatcher's [StepWatch]
//! every `poll_interval`. A step older than `LeaseConfig::step_timeout`
//! triggers the configured [WatchdogAction] before the lease can expire.
//!
//! [StepWatch]: crate::watchdog::StepWatch

use std::time::Duration;

use strand_kernel::StrandId;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{Dispatcher, PollReport};
use crate::watchdog::{StuckStep, WatchdogAction};

const MIN_SUPERVISE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker loop panicked or was cancelled: {0}")]
    Join(String),
    #[error("step of strand {strand_id} ({prog} at {label}) has run for {elapsed_ms}ms, past the step timeout")]
    StuckStep {
        strand_id: StrandId,
        prog: String,
        label: String,
        elapsed_ms: i64,
    },
}

impl From<StuckStep> for PoolError {
    fn from(stuck: StuckStep) -> Self {
        PoolError::StuckStep {
            strand_id: stuck.strand_id,
            prog: stuck.prog,
            label: stuck.label,
            elapsed_ms: stuck.elapsed.num_milliseconds(),
        }
    }
}

pub struct WorkerPool {
    dispatcher: Dispatcher,
    workers: usize,
    poll_interval: Duration,
    watchdog: WatchdogAction,
}

impl WorkerPool {
    pub fn new(dispatcher: Dispatcher, workers: usize, poll_interval: Duration) -> Self {
        Self {
            dispatcher,
            workers: workers.max(1),
            poll_interval,
            watchdog: WatchdogAction::default(),
        }
    }

    /// Reaction to a stuck step; aborts the process unless told otherwise.
    pub fn with_watchdog(mut self, action: WatchdogAction) -> Self {
        self.watchdog = action;
        self
    }

    /// Runs until `shutdown` becomes true; returns the merged poll totals.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<PollReport, PoolError> {
        tracing::info!(
            worker_id = %self.dispatcher.worker_id(),
            workers = self.workers,
            "worker pool starting"
        );
        let mut loops = JoinSet::new();
        for index in 0..self.workers {
            loops.spawn(worker_loop(
                index,
                self.dispatcher.clone(),
                self.poll_interval,
                shutdown.clone(),
            ));
        }
        let watch = self.dispatcher.step_watch().clone();
        let clock = self.dispatcher.clock().clone();
        let step_timeout = self.dispatcher.config().lease.step_timeout;
        let mut supervise = tokio::time::interval(self.poll_interval.max(MIN_SUPERVISE_INTERVAL));
        supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut total = PollReport::default();
        loop {
            tokio::select! {
                joined = loops.join_next() => {
                    let Some(joined) = joined else { break };
                    let report = joined.map_err(|e| PoolError::Join(e.to_string()))?;
                    total.merge(&report);
                }
                _ = supervise.tick() => {
                    let Some(stuck) = watch.overdue(clock.now(), step_timeout).into_iter().next() else {
                        continue;
                    };
                    tracing::error!(
                        worker_id = %self.dispatcher.worker_id(),
                        strand_id = %stuck.strand_id,
                        prog = %stuck.prog,
                        label = %stuck.label,
                        started_at = %stuck.started_at,
                        elapsed_ms = stuck.elapsed.num_milliseconds(),
                        timeout_ms = step_timeout.num_milliseconds(),
                        action = ?self.watchdog,
                        "step exceeded its timeout"
                    );
                    match self.watchdog {
                        WatchdogAction::Abort => std::process::abort(),
                        WatchdogAction::StopWorkers => {
                            loops.abort_all();
                            return Err(stuck.into());
                        }
                    }
                }
            }
        }
        tracing::info!(
            worker_id = %self.dispatcher.worker_id(),
            steps = total.steps,
            exited = total.exited,
            failed = total.failed,
            "worker pool stopped"
        );
        Ok(total)
    }
}

async fn worker_loop(
    index: usize,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> PollReport {
    let mut total = PollReport::default();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let poller = dispatcher.clone();
        let idle = match tokio::task::spawn_blocking(move || poller.poll_once()).await {
            Ok(Ok(report)) => {
                total.merge(&report);
                report.is_idle()
            }
            Ok(Err(err)) => {
                tracing::error!(worker_loop = index, error = %err, "poll failed");
                total.errors += 1;
                true
            }
            Err(err) => {
                tracing::error!(worker_loop = index, error = %err, "poll task died");
                total.errors += 1;
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(worker_loop = index, steps = total.steps, "worker loop stopped");
    total
}
