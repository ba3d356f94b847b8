//! Scheduler: runnable-strand scan and lease claim.
//!
//! [StrandScheduler::scan] lists claimable strands, oldest schedule first;
//! [StrandScheduler::claim] takes the conditional lease for one of them. Losing
//! the race to another worker is not an error, the candidate is skipped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use strand_kernel::{KernelError, Strand, StrandId, StrandStore};

use crate::lease::{LeaseConfig, WorkerLease};

/// Default number of candidates per scan.
pub const DISPATCH_SCAN_LIMIT: usize = 16;

/// A strand claimed by this worker.
#[derive(Clone, Debug)]
pub struct Claim {
    pub strand: Strand,
    pub lease: WorkerLease,
    /// The previous holder's lease had expired (crashed or stalled worker).
    pub reclaimed: bool,
}

/// Scan and claim over a [StrandStore], with the lease length applied to
/// every claim.
#[derive(Clone)]
pub struct StrandScheduler {
    store: Arc<dyn StrandStore>,
    lease: LeaseConfig,
    scan_limit: usize,
}

impl StrandScheduler {
    /// `scan_limit` is clamped to at least one candidate.
    pub fn new(store: Arc<dyn StrandStore>, lease: LeaseConfig, scan_limit: usize) -> Self {
        Self {
            store,
            lease,
            scan_limit: scan_limit.max(1),
        }
    }

    /// Lease tuning applied by [StrandScheduler::claim].
    pub fn lease_config(&self) -> &LeaseConfig {
        &self.lease
    }

    /// Runnable strands, oldest schedule first.
    pub fn scan(
        &self,
        now: DateTime<Utc>,
        skip: &HashSet<StrandId>,
    ) -> Result<Vec<Strand>, KernelError> {
        self.store.list_runnable(now, self.scan_limit, skip)
    }

    /// Tries to lease `candidate` for `worker_id`. `None` when another worker
    /// won the race or the strand stopped being runnable since the scan.
    pub fn claim(
        &self,
        candidate: &Strand,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, KernelError> {
        let expires_at = now + self.lease.lease_ttl;
        let Some(token) = self.store.try_lease(candidate.id, worker_id, now, expires_at)? else {
            return Ok(None);
        };
        // Re-read under the lease: the scanned row may predate another commit.
        let strand = self.store.get(candidate.id)?;
        Ok(Some(Claim {
            reclaimed: candidate.lease.is_some(),
            strand,
            lease: WorkerLease::from_token(token),
        }))
    }
}
