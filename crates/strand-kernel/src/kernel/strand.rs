//! Strand: one persisted, resumable workflow instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::frame::Frame;
use crate::kernel::identity::{new_strand_id, StrandId, WorkerId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    pub id: StrandId,
    pub parent_id: Option<StrandId>,
    pub prog: String,
    pub label: String,
    /// Call stack, innermost frame last.
    pub stack: Vec<Frame>,
    pub schedule: DateTime<Utc>,
    pub lease: Option<DateTime<Utc>>,
    pub lease_owner: Option<WorkerId>,
    /// Bumped on every lease acquisition (and on revocation); fences commits.
    pub lease_version: u64,
    /// Bumped on every semaphore set targeting this strand.
    pub signal_version: u64,
    pub exitval: Option<Value>,
    pub fault: Option<String>,
    pub try_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state reported by status queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrandState {
    Running,
    Waiting,
    Exited,
    Failed,
}

impl Strand {
    pub fn from_new(new: NewStrand, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            parent_id: new.parent_id,
            prog: new.prog,
            label: new.label,
            stack: new.stack,
            schedule: new.schedule,
            lease: None,
            lease_owner: None,
            lease_version: 0,
            signal_version: 0,
            exitval: None,
            fault: None,
            try_count: 0,
            created_at: now,
        }
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn retval(&self) -> Option<&Value> {
        self.top_frame().and_then(Frame::retval)
    }

    pub fn is_terminated(&self) -> bool {
        self.exitval.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.fault.is_some()
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some_and(|until| until > now)
    }

    /// Claimable by a worker at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminated() && !self.is_failed() && !self.is_leased(now) && self.schedule <= now
    }

    pub fn state(&self, now: DateTime<Utc>) -> StrandState {
        if self.is_failed() {
            StrandState::Failed
        } else if self.is_terminated() {
            StrandState::Exited
        } else if self.is_leased(now) {
            StrandState::Running
        } else {
            StrandState::Waiting
        }
    }
}

/// Insert request for a strand.
#[derive(Clone, Debug, PartialEq)]
pub struct NewStrand {
    pub id: StrandId,
    pub parent_id: Option<StrandId>,
    pub prog: String,
    pub label: String,
    pub stack: Vec<Frame>,
    pub schedule: DateTime<Utc>,
}

impl NewStrand {
    /// Root strand whose id doubles as the id of the object it manages.
    pub fn root(
        id: StrandId,
        prog: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
        schedule: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id: None,
            prog: prog.into(),
            label: label.into(),
            stack: vec![frame],
            schedule,
        }
    }

    pub fn child(
        parent_id: StrandId,
        prog: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
        schedule: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_strand_id(),
            parent_id: Some(parent_id),
            prog: prog.into(),
            label: label.into(),
            stack: vec![frame],
            schedule,
        }
    }
}

/// Proof of a lease acquisition; commits must present it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseToken {
    pub strand_id: StrandId,
    pub owner: WorkerId,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
    /// Signal version observed when the lease was taken.
    pub signal_version: u64,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn strand(now: DateTime<Utc>) -> Strand {
        Strand::from_new(
            NewStrand::root(new_strand_id(), "Test::Ping", "start", Frame::new(), now),
            now,
        )
    }

    #[test]
    fn runnable_excludes_leased_terminated_and_future() {
        let now = Utc::now();
        let mut s = strand(now);
        assert!(s.is_runnable(now));
        assert_eq!(s.state(now), StrandState::Waiting);

        s.lease = Some(now + Duration::seconds(30));
        assert!(!s.is_runnable(now));
        assert_eq!(s.state(now), StrandState::Running);
        assert!(s.is_runnable(now + Duration::seconds(31)));

        s.lease = None;
        s.schedule = now + Duration::minutes(5);
        assert!(!s.is_runnable(now));

        s.schedule = now;
        s.exitval = Some(json!({"msg": "done"}));
        assert!(!s.is_runnable(now));
        assert_eq!(s.state(now), StrandState::Exited);
    }

    #[test]
    fn failed_wins_over_other_states() {
        let now = Utc::now();
        let mut s = strand(now);
        s.fault = Some("BUG: boom".into());
        s.lease = Some(now + Duration::seconds(10));
        assert_eq!(s.state(now), StrandState::Failed);
        assert!(!s.is_runnable(now + Duration::minutes(1)));
    }
}
