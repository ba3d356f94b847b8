//! Deadlines: "reach this label by then, or the next fault is fatal".
//!
//! A deadline lives in the top frame, so it disappears with the frame (on pop)
//! and is persisted atomically with every step commit. Hopping to the target
//! label clears it, and so does returning to it through an in-strand back-link.
//! A deadline without a target is only cleared by leaving the frame.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::kernel::error::KernelError;
use crate::kernel::frame::{Frame, DEADLINE_ALLOW_EXTENSION, DEADLINE_AT, DEADLINE_TARGET};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deadline {
    pub target: Option<String>,
    pub deadline_at: DateTime<Utc>,
    pub allow_extension: bool,
}

impl Deadline {
    /// Reads the deadline registered in `frame`, if any.
    pub fn read(frame: &Frame) -> Result<Option<Self>, KernelError> {
        let Some(raw_at) = frame.get(DEADLINE_AT).filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let at = raw_at
            .as_str()
            .ok_or_else(|| KernelError::Frame(format!("{DEADLINE_AT} must be a string")))?;
        let deadline_at = DateTime::parse_from_rfc3339(at)
            .map_err(|e| KernelError::Frame(format!("{DEADLINE_AT}: {e}")))?
            .with_timezone(&Utc);
        let target = frame
            .get(DEADLINE_TARGET)
            .and_then(Value::as_str)
            .map(str::to_string);
        let allow_extension = frame
            .get(DEADLINE_ALLOW_EXTENSION)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Some(Self {
            target,
            deadline_at,
            allow_extension,
        }))
    }

    pub fn write(&self, frame: &mut Frame) {
        frame.insert(
            DEADLINE_TARGET,
            self.target.clone().map_or(Value::Null, Value::String),
        );
        frame.insert(DEADLINE_AT, Value::String(self.deadline_at.to_rfc3339()));
        frame.insert(DEADLINE_ALLOW_EXTENSION, Value::Bool(self.allow_extension));
    }

    pub fn clear(frame: &mut Frame) {
        frame.remove(DEADLINE_TARGET);
        frame.remove(DEADLINE_AT);
        frame.remove(DEADLINE_ALLOW_EXTENSION);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline_at
    }

    pub fn is_met_by(&self, label: &str) -> bool {
        self.target.as_deref() == Some(label)
    }

    /// True when the deadline passed and the strand sits anywhere but the target.
    pub fn is_exceeded_at(&self, label: &str, now: DateTime<Utc>) -> bool {
        self.is_expired(now) && !self.is_met_by(label)
    }

    /// Registers a deadline in `frame`.
    ///
    /// An existing deadline is replaced when the target differs, when the new
    /// instant is earlier, or when `allow_extension` is set. Returns whether the
    /// frame changed.
    pub fn register(
        frame: &mut Frame,
        target: Option<&str>,
        after: Duration,
        allow_extension: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let deadline_at = now + after;
        let replace = match Self::read(frame)? {
            None => true,
            Some(current) => {
                current.target.as_deref() != target
                    || current.deadline_at > deadline_at
                    || allow_extension
            }
        };
        if replace {
            Self {
                target: target.map(str::to_string),
                deadline_at,
                allow_extension,
            }
            .write(frame);
        }
        Ok(replace)
    }

    /// Clears the frame's deadline if `label` satisfies it.
    pub fn clear_if_met(frame: &mut Frame, label: &str) -> Result<(), KernelError> {
        if let Some(deadline) = Self::read(frame)? {
            if deadline.is_met_by(label) {
                Self::clear(frame);
            }
        }
        Ok(())
    }
}
