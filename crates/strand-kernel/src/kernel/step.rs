//! Step results: what a step asks the engine to do next.
//!
//! Steps never mutate the strand row directly. They return a [StepResult] (or
//! a [StepError]) and the dispatcher turns it into one atomic store commit.

use chrono::Duration;
use serde_json::{json, Value};

use crate::kernel::error::StepError;
use crate::kernel::frame::Frame;
use crate::kernel::prog::{Prog, ProgLabel};

/// Nap length used to park a strand until a semaphore or a child wakes it.
pub const HIBERNATE_DAYS: i64 = 365;

/// Control-flow outcome of one step.
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    /// Continue at `label` in the same frame; `frame_updates` are merged into it.
    Hop {
        label: String,
        frame_updates: Option<Frame>,
    },
    /// Suspend until `now + duration` (or an earlier semaphore wake-up).
    Nap(Duration),
    /// Start a child strand and park until it pops.
    Push {
        prog: String,
        label: String,
        frame: Frame,
        return_label: String,
    },
    /// In-strand subroutine: push a frame that links back to `return_label`.
    Call {
        prog: String,
        label: String,
        frame: Frame,
        return_label: String,
    },
    /// Return `value` to the caller frame or parent strand.
    Pop(Value),
    /// Terminate a root strand.
    Exit(Value),
}

pub type StepOutcome = Result<StepResult, StepError>;

impl StepResult {
    pub fn hop<L: ProgLabel>(label: L) -> Self {
        Self::Hop {
            label: label.as_str().to_string(),
            frame_updates: None,
        }
    }

    pub fn hop_with<L: ProgLabel>(label: L, frame_updates: Frame) -> Self {
        Self::Hop {
            label: label.as_str().to_string(),
            frame_updates: Some(frame_updates),
        }
    }

    pub fn nap(duration: Duration) -> Self {
        Self::Nap(duration)
    }

    pub fn nap_secs(secs: i64) -> Self {
        Self::Nap(Duration::seconds(secs))
    }

    pub fn hibernate() -> Self {
        Self::Nap(Duration::days(HIBERNATE_DAYS))
    }

    /// Starts `P` at `label` as a child strand; the caller resumes at `return_label`.
    pub fn push<P: Prog, R: ProgLabel>(label: P::Label, frame: Frame, return_label: R) -> Self {
        Self::Push {
            prog: P::NAME.to_string(),
            label: label.as_str().to_string(),
            frame,
            return_label: return_label.as_str().to_string(),
        }
    }

    pub fn call<P: Prog, R: ProgLabel>(label: P::Label, frame: Frame, return_label: R) -> Self {
        Self::Call {
            prog: P::NAME.to_string(),
            label: label.as_str().to_string(),
            frame,
            return_label: return_label.as_str().to_string(),
        }
    }

    pub fn pop(value: Value) -> Self {
        Self::Pop(value)
    }

    pub fn pop_msg(msg: impl Into<String>) -> Self {
        Self::Pop(json!({ "msg": msg.into() }))
    }

    pub fn exit(value: Value) -> Self {
        Self::Exit(value)
    }

    pub fn exit_msg(msg: impl Into<String>) -> Self {
        Self::Exit(json!({ "msg": msg.into() }))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hop { .. } => "hop",
            Self::Nap(_) => "nap",
            Self::Push { .. } => "push",
            Self::Call { .. } => "call",
            Self::Pop(_) => "pop",
            Self::Exit(_) => "exit",
        }
    }
}

/// Normalizes a pop/exit value: objects pass through, strings become `{"msg": ..}`.
pub fn normalize_return_value(value: Value) -> Result<Value, StepError> {
    match value {
        Value::Object(_) => Ok(value),
        Value::String(msg) => Ok(json!({ "msg": msg })),
        other => Err(StepError::logic(format!(
            "pop/exit value must be an object or a string, got {other}"
        ))),
    }
}
