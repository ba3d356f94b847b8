//! Read-only status queries over strands.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use strand_kernel::{Clock, Frame, KernelError, Strand, StrandId, StrandState, StrandStore};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StrandStatus {
    pub id: StrandId,
    pub prog: String,
    pub label: String,
    pub stack: Vec<Frame>,
    pub retval: Option<Value>,
    pub exitval: Option<Value>,
    pub fault: Option<String>,
    pub try_count: u32,
    pub state: StrandState,
}

impl StrandStatus {
    fn from_strand(strand: Strand, state: StrandState) -> Self {
        Self {
            retval: strand.retval().cloned(),
            id: strand.id,
            prog: strand.prog,
            label: strand.label,
            stack: strand.stack,
            exitval: strand.exitval,
            fault: strand.fault,
            try_count: strand.try_count,
            state,
        }
    }
}

#[derive(Clone)]
pub struct StatusQuery {
    store: Arc<dyn StrandStore>,
    clock: Arc<dyn Clock>,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn StrandStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// `None` once the strand is gone (children are deleted when they pop).
    pub fn status(&self, id: StrandId) -> Result<Option<StrandStatus>, KernelError> {
        let now = self.clock.now();
        Ok(self.store.load(id)?.map(|strand| {
            let state = strand.state(now);
            StrandStatus::from_strand(strand, state)
        }))
    }

    pub fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError> {
        self.store.children(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use strand_kernel::{new_strand_id, InMemoryStrandStore, ManualClock, NewStrand};

    #[test]
    fn status_reports_state_and_serializes() {
        let store = Arc::new(InMemoryStrandStore::new());
        let clock = Arc::new(ManualClock::default());
        let now = clock.now();
        let id = new_strand_id();
        let mut frame = Frame::for_subject(id);
        frame.set_retval(json!({"msg": "inbound_setup is complete"}));
        store
            .create(NewStrand::root(id, "Test::Ping", "wait", frame, now), now)
            .unwrap();

        let query = StatusQuery::new(store, clock);
        let status = query.status(id).unwrap().expect("status");
        assert_eq!(status.state, StrandState::Waiting);
        assert_eq!(
            status.retval,
            Some(json!({"msg": "inbound_setup is complete"}))
        );
        let encoded = serde_json::to_value(&status).unwrap();
        assert_eq!(encoded["state"], json!("waiting"));
        assert!(query.status(new_strand_id()).unwrap().is_none());
    }
}
