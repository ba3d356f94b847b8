//! Strand kernel API.
//!
//! Strand (identity, stack, lease, schedule), Frame (one call-stack entry),
//! Prog (labelled steps), StepResult (control flow), StrandStore (atomic
//! persistence). The runtime crate drives these through its dispatcher.

pub mod clock;
pub mod context;
pub mod deadline;
pub mod error;
pub mod frame;
pub mod identity;
pub mod memory_store;
pub mod prog;
pub mod semaphore;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod step;
pub mod store;
pub mod strand;
pub mod transition;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{StepContext, StepEffects};
pub use deadline::Deadline;
pub use error::{KernelError, StepError};
pub use frame::{Frame, Link, PendingCall};
pub use identity::{new_strand_id, StrandId, WorkerId};
pub use memory_store::InMemoryStrandStore;
pub use prog::{Prog, ProgLabel, ProgRegistry, ProgRegistryBuilder, RegisteredProg};
pub use semaphore::SemaphoreRegistry;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteStrandStore;
pub use step::{normalize_return_value, StepOutcome, StepResult, HIBERNATE_DAYS};
pub use store::{ParentUpdate, StrandCommit, StrandStore, StrandUpdate};
pub use strand::{LeaseToken, NewStrand, Strand, StrandState};
pub use transition::{plan, Transition, TransitionInput, CHILDREN_PENDING_NAP_SECS};
