//! Lease guard: single-owner execution of a strand.
//!
//! [WorkerLease] wraps the [LeaseToken] returned by the store. The dispatcher
//! calls [WorkerLease::check_execution_allowed] before every step, so a worker
//! whose lease ran out stops instead of racing the next holder (whose commits
//! would fence it off anyway). Crash recovery is lease expiry: an expired lease
//! makes the strand claimable again.

use chrono::{DateTime, Duration, Utc};

use strand_kernel::{KernelError, LeaseToken, StrandId};

/// Strict single-owner execution guard for a claimed strand. Verify ownership
/// and expiry before every step.
#[derive(Clone, Debug)]
pub struct WorkerLease {
    token: LeaseToken,
}

impl WorkerLease {
    /// Wraps the token handed out by [strand_kernel::StrandStore::try_lease].
    pub fn from_token(token: LeaseToken) -> Self {
        Self { token }
    }

    /// Fencing token for commits, releases and fault marking.
    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    pub fn strand_id(&self) -> StrandId {
        self.token.strand_id
    }

    pub fn worker_id(&self) -> &str {
        &self.token.owner
    }

    /// Returns true once the lease has passed its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.token.expires_at
    }

    /// Enforce single-owner: `Ok(())` only if `worker_id` holds the lease.
    pub fn verify_owner(&self, worker_id: &str) -> Result<(), KernelError> {
        if self.token.owner != worker_id {
            return Err(KernelError::LeaseLost {
                strand_id: self.token.strand_id,
                owner: worker_id.to_string(),
                version: self.token.version,
            });
        }
        Ok(())
    }

    /// `Ok(())` if `worker_id` owns the lease and it has not expired.
    pub fn check_execution_allowed(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        self.verify_owner(worker_id)?;
        if self.is_expired(now) {
            return Err(KernelError::LeaseLost {
                strand_id: self.token.strand_id,
                owner: self.token.owner.clone(),
                version: self.token.version,
            });
        }
        Ok(())
    }
}

/// Lease tuning knobs shared by the scheduler, the dispatcher and the
/// stuck-step watchdog.
///
/// A run starts its last step before `step_budget` has elapsed and that step
/// must finish within `step_timeout`, so `step_budget + step_timeout` never
/// exceeds `lease_ttl`: a live worker always commits before its lease can be
/// reclaimed.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// How long a claim stays exclusive.
    pub lease_ttl: Duration,
    /// How long one strand may keep hopping before yielding.
    pub step_budget: Duration,
    /// Longest a single step may run before the watchdog fires.
    pub step_timeout: Duration,
}

impl LeaseConfig {
    /// Budget of a quarter of the lease; the step timeout takes the rest.
    pub fn new(lease_ttl: Duration) -> Self {
        let step_budget = lease_ttl / 4;
        Self {
            lease_ttl,
            step_budget,
            step_timeout: lease_ttl - step_budget,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::new(Duration::seconds(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_kernel::new_strand_id;

    fn lease(now: DateTime<Utc>) -> WorkerLease {
        WorkerLease::from_token(LeaseToken {
            strand_id: new_strand_id(),
            owner: "worker-a".into(),
            version: 1,
            expires_at: now + Duration::seconds(30),
            signal_version: 0,
        })
    }

    #[test]
    fn only_owner_may_execute() {
        let now = Utc::now();
        let lease = lease(now);
        assert!(lease.check_execution_allowed("worker-a", now).is_ok());
        assert!(lease.check_execution_allowed("worker-b", now).is_err());
    }

    #[test]
    fn expired_lease_blocks_execution() {
        let now = Utc::now();
        let lease = lease(now);
        assert!(lease
            .check_execution_allowed("worker-a", now + Duration::seconds(30))
            .is_err());
    }

    #[test]
    fn default_budget_is_quarter_of_ttl() {
        let config = LeaseConfig::default();
        assert_eq!(config.lease_ttl, Duration::seconds(120));
        assert_eq!(config.step_budget, Duration::seconds(30));
        assert_eq!(config.step_timeout, Duration::seconds(90));
    }
}
