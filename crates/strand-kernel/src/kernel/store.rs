//! StrandStore: persistence contract for strands and semaphores.
//!
//! Every state change a step causes goes through [StrandStore::commit] as one
//! atomic unit, fenced on the lease token presented by the worker.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::kernel::error::KernelError;
use crate::kernel::frame::Frame;
use crate::kernel::identity::StrandId;
use crate::kernel::strand::{LeaseToken, NewStrand, Strand};

/// New state of the leased strand.
#[derive(Clone, Debug, PartialEq)]
pub enum StrandUpdate {
    Continue {
        prog: String,
        label: String,
        stack: Vec<Frame>,
        schedule: DateTime<Utc>,
    },
    /// Only move the schedule; leaves label and stack untouched.
    Reschedule { schedule: DateTime<Utc> },
    Exit { exitval: Value, stack: Vec<Frame> },
    Delete,
}

/// Child-to-parent return applied in the child's commit.
#[derive(Clone, Debug, PartialEq)]
pub struct ParentUpdate {
    pub parent_id: StrandId,
    pub child_id: StrandId,
    pub retval: Value,
}

/// Everything one step changes, applied atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct StrandCommit {
    pub update: StrandUpdate,
    pub release_lease: bool,
    pub created: Vec<NewStrand>,
    /// Targets that no longer exist are skipped.
    pub semaphores_set: Vec<(StrandId, String)>,
    /// Names consumed on the committing strand.
    pub semaphores_consumed: Vec<String>,
    pub parent_update: Option<ParentUpdate>,
}

impl StrandCommit {
    pub fn new(update: StrandUpdate, release_lease: bool) -> Self {
        Self {
            update,
            release_lease,
            created: Vec::new(),
            semaphores_set: Vec::new(),
            semaphores_consumed: Vec::new(),
            parent_update: None,
        }
    }
}

pub trait StrandStore: Send + Sync {
    fn create(&self, strand: NewStrand, now: DateTime<Utc>) -> Result<Strand, KernelError>;

    fn load(&self, id: StrandId) -> Result<Option<Strand>, KernelError>;

    fn get(&self, id: StrandId) -> Result<Strand, KernelError> {
        self.load(id)?.ok_or(KernelError::StrandNotFound(id))
    }

    /// Runnable strands ordered by schedule, skipping ids in `skip`.
    fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &HashSet<StrandId>,
    ) -> Result<Vec<Strand>, KernelError>;

    /// Atomic conditional lease acquisition. `None` when the strand is not
    /// runnable at `now` (already leased, napping, terminated, failed, gone).
    fn try_lease(
        &self,
        id: StrandId,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseToken>, KernelError>;

    /// Applies `commit` if `lease` is still the current lease, else `LeaseLost`.
    fn commit(
        &self,
        lease: &LeaseToken,
        commit: &StrandCommit,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError>;

    /// Releases the lease after a retriable fault; nothing else changes
    /// except `try_count` and the retry schedule.
    fn release(
        &self,
        lease: &LeaseToken,
        try_count: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), KernelError>;

    /// Records a fatal fault and releases the lease.
    fn mark_failed(&self, lease: &LeaseToken, fault: &str) -> Result<(), KernelError>;

    fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError>;

    /// Idempotent; wakes the strand. Errors when the strand does not exist.
    fn set_semaphore(
        &self,
        id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError>;

    fn semaphores(&self, id: StrandId) -> Result<Vec<String>, KernelError>;

    /// Check-and-delete; true when the semaphore was set.
    fn consume_semaphore(&self, id: StrandId, name: &str) -> Result<bool, KernelError>;
}

/// Returns `LeaseLost` unless `strand` is still held under `lease`.
pub(crate) fn check_fence(strand: &Strand, lease: &LeaseToken) -> Result<(), KernelError> {
    let owned = strand.lease.is_some()
        && strand.lease_owner.as_deref() == Some(lease.owner.as_str())
        && strand.lease_version == lease.version;
    if owned {
        Ok(())
    } else {
        Err(KernelError::LeaseLost {
            strand_id: lease.strand_id,
            owner: lease.owner.clone(),
            version: lease.version,
        })
    }
}

pub(crate) fn clear_lease(strand: &mut Strand) {
    strand.lease = None;
    strand.lease_owner = None;
}

/// Applies the self update of a commit to the in-memory row. Returns false
/// when the row must be deleted.
pub(crate) fn apply_update(
    strand: &mut Strand,
    lease: &LeaseToken,
    commit: &StrandCommit,
    now: DateTime<Utc>,
) -> bool {
    match &commit.update {
        StrandUpdate::Continue {
            prog,
            label,
            stack,
            schedule,
        } => {
            strand.prog = prog.clone();
            strand.label = label.clone();
            strand.stack = stack.clone();
            strand.schedule = *schedule;
        }
        StrandUpdate::Reschedule { schedule } => strand.schedule = *schedule,
        StrandUpdate::Exit { exitval, stack } => {
            strand.exitval = Some(exitval.clone());
            strand.stack = stack.clone();
            strand.schedule = now;
        }
        StrandUpdate::Delete => return false,
    }
    // A signal that arrived while the step ran must not be slept through.
    if strand.signal_version != lease.signal_version && strand.schedule > now {
        strand.schedule = now;
    }
    strand.try_count = 0;
    if commit.release_lease || strand.is_terminated() {
        clear_lease(strand);
    }
    true
}

/// Stores the child's return value in the parent and resumes it.
///
/// The parent's lease is revoked so a worker running the parent concurrently
/// cannot overwrite the return with a stale stack.
pub(crate) fn apply_parent_update(
    parent: &mut Strand,
    update: &ParentUpdate,
    now: DateTime<Utc>,
) -> Result<(), KernelError> {
    let Some(top) = parent.stack.last_mut() else {
        return Err(KernelError::Frame(format!(
            "parent {} has an empty stack",
            parent.id
        )));
    };
    top.set_retval(update.retval.clone());
    if let Some(call) = top.pending_call()? {
        if call.child_id == update.child_id {
            top.clear_pending_call();
            parent.label = call.return_label;
        }
    }
    parent.schedule = now;
    if parent.lease.is_some() {
        clear_lease(parent);
        parent.lease_version += 1;
    }
    Ok(())
}

/// Wake-up side of a semaphore set.
pub(crate) fn wake_for_signal(strand: &mut Strand, now: DateTime<Utc>) {
    strand.signal_version += 1;
    if !strand.is_terminated() && !strand.is_failed() && strand.schedule > now {
        strand.schedule = now;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::kernel::frame::PendingCall;
    use crate::kernel::identity::new_strand_id;

    fn leased(now: DateTime<Utc>) -> (Strand, LeaseToken) {
        let mut strand = Strand::from_new(
            NewStrand::root(new_strand_id(), "Test::Ping", "start", Frame::new(), now),
            now,
        );
        strand.lease = Some(now + Duration::seconds(30));
        strand.lease_owner = Some("w1".into());
        strand.lease_version = 3;
        let token = LeaseToken {
            strand_id: strand.id,
            owner: "w1".into(),
            version: 3,
            expires_at: now + Duration::seconds(30),
            signal_version: 0,
        };
        (strand, token)
    }

    #[test]
    fn fence_rejects_stale_versions() {
        let now = Utc::now();
        let (mut strand, token) = leased(now);
        assert!(check_fence(&strand, &token).is_ok());
        strand.lease_version = 4;
        assert!(matches!(
            check_fence(&strand, &token),
            Err(KernelError::LeaseLost { version: 3, .. })
        ));
    }

    #[test]
    fn late_signal_cuts_nap_short() {
        let now = Utc::now();
        let (mut strand, token) = leased(now);
        wake_for_signal(&mut strand, now);
        let commit = StrandCommit::new(
            StrandUpdate::Reschedule {
                schedule: now + Duration::minutes(10),
            },
            true,
        );
        assert!(apply_update(&mut strand, &token, &commit, now));
        assert_eq!(strand.schedule, now);
        assert!(strand.lease.is_none());
    }

    #[test]
    fn parent_update_resumes_matching_pending_call() {
        let now = Utc::now();
        let (mut parent, _) = leased(now);
        let child_id = new_strand_id();
        parent.stack[0]
            .set_pending_call(&PendingCall {
                child_id,
                return_label: "wait".into(),
            })
            .unwrap();
        parent.schedule = now + Duration::days(365);
        let parent_id = parent.id;

        apply_parent_update(
            &mut parent,
            &ParentUpdate {
                parent_id,
                child_id,
                retval: json!({"msg": "ok"}),
            },
            now,
        )
        .unwrap();

        assert_eq!(parent.label, "wait");
        assert_eq!(parent.retval(), Some(&json!({"msg": "ok"})));
        assert_eq!(parent.schedule, now);
        assert!(parent.lease.is_none());
        assert_eq!(parent.lease_version, 4);
    }
}
