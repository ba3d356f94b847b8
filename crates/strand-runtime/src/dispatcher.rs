//! Dispatcher: scan, claim, run, persist.
//!
//! One [Dispatcher::poll_once] scans runnable strands, leases each candidate in
//! turn and runs it: steps execute back to back while they hop and the step
//! budget lasts, every result is committed atomically, and faults are
//! classified into "retry on a later poll" or "fatal". A store error that
//! aborts a run releases the lease before it propagates. Every step is
//! registered in the [StepWatch] for the pool's watchdog.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use strand_kernel::{
    plan, Clock, Deadline, KernelError, ProgRegistry, StepContext, StepError, StepResult, Strand,
    StrandCommit, StrandId, StrandStore, StrandUpdate, TransitionInput, WorkerId, HIBERNATE_DAYS,
};

use crate::lease::{LeaseConfig, WorkerLease};
use crate::scheduler::{StrandScheduler, DISPATCH_SCAN_LIMIT};
use crate::watchdog::StepWatch;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub worker_id: WorkerId,
    pub lease: LeaseConfig,
    pub scan_limit: usize,
    /// Delay before a strand whose step faulted is retried.
    pub retry_interval: Duration,
    /// Upper bound on steps per claim, whatever the clock says.
    pub max_steps_per_run: usize,
}

impl DispatcherConfig {
    pub fn new(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease: LeaseConfig::default(),
            scan_limit: DISPATCH_SCAN_LIMIT,
            retry_interval: Duration::seconds(1),
            max_steps_per_run: 1000,
        }
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_scan_limit(mut self, scan_limit: usize) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// Outcome of one step.
#[derive(Clone, Debug, PartialEq)]
pub enum StepReport {
    /// Committed and still holding the lease; the next step runs immediately.
    Continued,
    /// Committed; runs again at `until` or on a semaphore.
    Napped { until: DateTime<Utc> },
    /// Waiting for a pushed child strand.
    Parked,
    Exited,
    /// Popped into its parent and deleted.
    Returned,
    Retrying { try_count: u32 },
    Failed { fault: String },
    LeaseLost,
}

/// Outcome of running one claimed strand.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub strand_id: StrandId,
    pub steps: usize,
    pub last: StepReport,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub scanned: usize,
    pub claimed: usize,
    pub reclaimed: usize,
    pub steps: usize,
    pub exited: usize,
    pub retried: usize,
    pub failed: usize,
    pub lease_lost: usize,
    pub errors: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    pub fn merge(&mut self, other: &PollReport) {
        self.scanned += other.scanned;
        self.claimed += other.claimed;
        self.reclaimed += other.reclaimed;
        self.steps += other.steps;
        self.exited += other.exited;
        self.retried += other.retried;
        self.failed += other.failed;
        self.lease_lost += other.lease_lost;
        self.errors += other.errors;
    }

    fn record(&mut self, run: &RunReport) {
        self.steps += run.steps;
        match run.last {
            StepReport::Exited => self.exited += 1,
            StepReport::Retrying { .. } => self.retried += 1,
            StepReport::Failed { .. } => self.failed += 1,
            StepReport::LeaseLost => self.lease_lost += 1,
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgRegistry>,
    clock: Arc<dyn Clock>,
    scheduler: StrandScheduler,
    config: DispatcherConfig,
    running: Arc<Mutex<HashSet<StrandId>>>,
    watch: StepWatch,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgRegistry>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        let scheduler = StrandScheduler::new(store.clone(), config.lease.clone(), config.scan_limit);
        Self {
            store,
            registry,
            clock,
            scheduler,
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
            watch: StepWatch::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Steps currently executing on any clone of this dispatcher.
    pub fn step_watch(&self) -> &StepWatch {
        &self.watch
    }

    /// One scan-claim-run pass.
    pub fn poll_once(&self) -> Result<PollReport, KernelError> {
        let now = self.clock.now();
        let skip = self.running_snapshot()?;
        let candidates = self.scheduler.scan(now, &skip)?;
        let mut report = PollReport {
            scanned: candidates.len(),
            ..PollReport::default()
        };
        for candidate in candidates {
            // Another loop of this worker may have picked it up since the snapshot.
            if !self.mark_running(candidate.id)? {
                continue;
            }
            let claim = match self
                .scheduler
                .claim(&candidate, &self.config.worker_id, self.clock.now())
            {
                Ok(Some(claim)) => claim,
                Ok(None) => {
                    self.unmark_running(candidate.id)?;
                    continue;
                }
                Err(err) => {
                    tracing::error!(strand_id = %candidate.id, error = %err, "lease acquisition failed");
                    self.unmark_running(candidate.id)?;
                    report.errors += 1;
                    continue;
                }
            };
            report.claimed += 1;
            if claim.reclaimed {
                report.reclaimed += 1;
                tracing::info!(
                    strand_id = %claim.strand.id,
                    prog = %claim.strand.prog,
                    label = %claim.strand.label,
                    worker_id = %self.config.worker_id,
                    "reclaiming strand after lease expiry"
                );
            }
            let run = self.run_strand(claim.strand, &claim.lease);
            self.unmark_running(candidate.id)?;
            match run {
                Ok(run) => report.record(&run),
                Err(err) => {
                    tracing::error!(strand_id = %candidate.id, error = %err, "strand run aborted");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Runs a leased strand until it stops hopping or the budget is spent.
    pub fn run_strand(&self, strand: Strand, lease: &WorkerLease) -> Result<RunReport, KernelError> {
        let started = self.clock.now();
        let budget_end = started + self.config.lease.step_budget;
        let strand_id = strand.id;
        let mut strand = strand;
        let mut steps = 0;
        loop {
            let now = self.clock.now();
            if let Err(err) = lease.check_execution_allowed(&self.config.worker_id, now) {
                tracing::warn!(strand_id = %strand_id, error = %err, "lease expired mid-run");
                return Ok(RunReport {
                    strand_id,
                    steps,
                    last: StepReport::LeaseLost,
                });
            }
            steps += 1;
            let keep_lease = now < budget_end && steps < self.config.max_steps_per_run;
            let last = match self.step(&strand, lease, now, keep_lease) {
                Ok(last) => last,
                Err(err) => return Err(self.abandon(&strand, lease, err)),
            };
            if last != StepReport::Continued {
                return Ok(RunReport {
                    strand_id,
                    steps,
                    last,
                });
            }
            strand = match self.store.get(strand_id) {
                Ok(next) => next,
                Err(err) => return Err(self.abandon(&strand, lease, err)),
            };
        }
    }

    /// Hands the strand back after a store error so another poll can pick it
    /// up without waiting for the lease to run out. The try count is left
    /// alone: the step itself did not fault.
    fn abandon(&self, strand: &Strand, lease: &WorkerLease, err: KernelError) -> KernelError {
        if matches!(err, KernelError::LeaseLost { .. }) {
            return err;
        }
        let now = self.clock.now();
        match self.store.release(lease.token(), strand.try_count, now) {
            Ok(()) => tracing::warn!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                error = %err,
                "run aborted by store error, lease released"
            ),
            Err(release_err) => tracing::warn!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                error = %err,
                release_error = %release_err,
                "run aborted by store error, lease release failed"
            ),
        }
        err
    }

    fn step(
        &self,
        strand: &Strand,
        lease: &WorkerLease,
        now: DateTime<Utc>,
        keep_lease: bool,
    ) -> Result<StepReport, KernelError> {
        let prog = match self.registry.get(&strand.prog) {
            Ok(prog) => prog,
            Err(err) => return self.fault(strand, lease, now, err.into(), false),
        };
        let top = strand.top_frame().cloned().unwrap_or_default();

        match top.pending_call() {
            Ok(Some(call)) => {
                if self.store.load(call.child_id)?.is_some() {
                    let commit = StrandCommit::new(
                        StrandUpdate::Reschedule {
                            schedule: now + Duration::days(HIBERNATE_DAYS),
                        },
                        true,
                    );
                    return self.persist(strand, lease, &commit, now, StepReport::Parked);
                }
                let err = StepError::logic(format!(
                    "pending call to {} but the child strand is gone",
                    call.child_id
                ));
                return self.fault(strand, lease, now, err, false);
            }
            Ok(None) => {}
            Err(err) => return self.fault(strand, lease, now, err.into(), false),
        }

        let deadline_exceeded = match Deadline::read(&top) {
            Ok(Some(deadline)) if deadline.is_exceeded_at(&strand.label, now) => {
                tracing::warn!(
                    strand_id = %strand.id,
                    prog = %strand.prog,
                    label = %strand.label,
                    deadline_target = ?deadline.target,
                    deadline_at = %deadline.deadline_at,
                    "deadline exceeded"
                );
                true
            }
            Ok(_) => false,
            Err(err) => return self.fault(strand, lease, now, err.into(), false),
        };

        let mut ctx = StepContext::new(strand, self.store.as_ref(), &self.registry, now);
        let guard = self.watch.start(strand, now);
        let result = match prog.before_run(&strand.label, &mut ctx) {
            Ok(Some(result)) => Ok(result),
            Ok(None) => prog.run(&strand.label, &mut ctx),
            Err(err) => Err(err),
        };
        drop(guard);
        let (frame, effects) = ctx.into_parts();
        let transition = result.and_then(|result| {
            let has_children = match result {
                StepResult::Pop(_) | StepResult::Exit(_) => {
                    !self.store.children(strand.id)?.is_empty()
                }
                _ => false,
            };
            tracing::debug!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                result = result.kind(),
                "step finished"
            );
            plan(
                TransitionInput {
                    strand,
                    frame,
                    effects,
                    registry: &self.registry,
                    now,
                    has_children,
                    keep_lease,
                },
                result,
            )
        });

        match transition {
            Ok(transition) => {
                let report = if transition.continues {
                    StepReport::Continued
                } else {
                    settled_report(&transition.commit)
                };
                self.persist(strand, lease, &transition.commit, now, report)
            }
            Err(err) => self.fault(strand, lease, now, err, deadline_exceeded),
        }
    }

    fn persist(
        &self,
        strand: &Strand,
        lease: &WorkerLease,
        commit: &StrandCommit,
        now: DateTime<Utc>,
        report: StepReport,
    ) -> Result<StepReport, KernelError> {
        match self.store.commit(lease.token(), commit, now) {
            Ok(()) => {}
            Err(KernelError::LeaseLost { .. }) => {
                tracing::warn!(
                    strand_id = %strand.id,
                    prog = %strand.prog,
                    label = %strand.label,
                    worker_id = %self.config.worker_id,
                    "commit fenced off, lease taken over"
                );
                return Ok(StepReport::LeaseLost);
            }
            Err(err) => return Err(err),
        }
        match &report {
            StepReport::Exited => {
                tracing::info!(strand_id = %strand.id, prog = %strand.prog, "strand exited")
            }
            StepReport::Returned => {
                tracing::debug!(strand_id = %strand.id, prog = %strand.prog, parent_id = ?strand.parent_id, "strand returned to parent")
            }
            _ => {}
        }
        Ok(report)
    }

    fn fault(
        &self,
        strand: &Strand,
        lease: &WorkerLease,
        now: DateTime<Utc>,
        err: StepError,
        deadline_exceeded: bool,
    ) -> Result<StepReport, KernelError> {
        let try_count = strand.try_count.saturating_add(1);
        let outcome = if err.is_fatal() || deadline_exceeded {
            let fault = if deadline_exceeded && !err.is_fatal() {
                format!("deadline exceeded at {}: {}", strand.label, err)
            } else {
                err.to_string()
            };
            tracing::error!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                try_count,
                error = %err,
                "fatal fault, strand failed"
            );
            self.store
                .mark_failed(lease.token(), &fault)
                .map(|()| StepReport::Failed { fault })
        } else {
            tracing::warn!(
                strand_id = %strand.id,
                prog = %strand.prog,
                label = %strand.label,
                try_count,
                error = %err,
                "step faulted, will retry"
            );
            self.store
                .release(lease.token(), try_count, now + self.config.retry_interval)
                .map(|()| StepReport::Retrying { try_count })
        };
        match outcome {
            Err(KernelError::LeaseLost { .. }) => Ok(StepReport::LeaseLost),
            other => other,
        }
    }

    fn running_snapshot(&self) -> Result<HashSet<StrandId>, KernelError> {
        self.running
            .lock()
            .map(|running| running.clone())
            .map_err(|_| KernelError::Store("dispatcher running set poisoned".into()))
    }

    fn mark_running(&self, id: StrandId) -> Result<bool, KernelError> {
        self.running
            .lock()
            .map(|mut running| running.insert(id))
            .map_err(|_| KernelError::Store("dispatcher running set poisoned".into()))
    }

    fn unmark_running(&self, id: StrandId) -> Result<(), KernelError> {
        self.running
            .lock()
            .map(|mut running| {
                running.remove(&id);
            })
            .map_err(|_| KernelError::Store("dispatcher running set poisoned".into()))
    }
}

fn settled_report(commit: &StrandCommit) -> StepReport {
    match &commit.update {
        StrandUpdate::Continue { schedule, .. } | StrandUpdate::Reschedule { schedule } => {
            StepReport::Napped { until: *schedule }
        }
        StrandUpdate::Exit { .. } => StepReport::Exited,
        StrandUpdate::Delete => StepReport::Returned,
    }
}
