//! Stuck-step watchdog.
//!
//! The dispatcher registers every in-flight step in a shared [StepWatch]; the
//! worker pool's supervisor checks it on each tick. A step that outlives
//! `LeaseConfig::step_timeout` would still be running when its lease expires
//! and another worker reclaims the strand, so the pool reacts before that
//! happens: abort the process, or stop every worker loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use strand_kernel::{Strand, StrandId};

/// What the pool does once a step overruns its timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Kill the whole process so no side effect can overlap a reclaimed run.
    #[default]
    Abort,
    /// Cancel the worker loops and return [crate::PoolError::StuckStep].
    StopWorkers,
}

/// A step that has been running longer than allowed.
#[derive(Clone, Debug, PartialEq)]
pub struct StuckStep {
    pub strand_id: StrandId,
    pub prog: String,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
struct InFlight {
    prog: String,
    label: String,
    started_at: DateTime<Utc>,
}

/// Registry of steps currently executing, shared by every clone of a
/// dispatcher.
#[derive(Clone, Debug, Default)]
pub struct StepWatch {
    in_flight: Arc<Mutex<HashMap<StrandId, InFlight>>>,
}

impl StepWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `strand` as running from `now` until the guard drops.
    pub fn start(&self, strand: &Strand, now: DateTime<Utc>) -> StepGuard {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(
                strand.id,
                InFlight {
                    prog: strand.prog.clone(),
                    label: strand.label.clone(),
                    started_at: now,
                },
            );
        }
        StepGuard {
            watch: self.clone(),
            strand_id: strand.id,
        }
    }

    /// Steps running for longer than `timeout` at `now`, oldest first.
    pub fn overdue(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<StuckStep> {
        let Ok(in_flight) = self.in_flight.lock() else {
            return Vec::new();
        };
        let mut stuck: Vec<StuckStep> = in_flight
            .iter()
            .filter(|(_, step)| now - step.started_at > timeout)
            .map(|(id, step)| StuckStep {
                strand_id: *id,
                prog: step.prog.clone(),
                label: step.label.clone(),
                started_at: step.started_at,
                elapsed: now - step.started_at,
            })
            .collect();
        stuck.sort_by_key(|step| step.started_at);
        stuck
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Removes its step from the watch when dropped, including on unwind.
#[must_use]
pub struct StepGuard {
    watch: StepWatch,
    strand_id: StrandId,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.watch.in_flight.lock() {
            in_flight.remove(&self.strand_id);
        }
    }
}
