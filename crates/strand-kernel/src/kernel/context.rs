//! Step context: what a step may read and the side effects it buffers.
//!
//! Reads (semaphores, children) go straight to the store. Writes are buffered
//! in [StepEffects] and committed together with the step's transition, so a
//! faulted step leaves no trace.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::kernel::deadline::Deadline;
use crate::kernel::error::{KernelError, StepError};
use crate::kernel::frame::Frame;
use crate::kernel::identity::StrandId;
use crate::kernel::prog::{Prog, ProgLabel, ProgRegistry};
use crate::kernel::store::StrandStore;
use crate::kernel::strand::{NewStrand, Strand};

/// Side effects collected during one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepEffects {
    pub consumed: Vec<String>,
    pub signals: Vec<(StrandId, String)>,
    pub buds: Vec<NewStrand>,
}

pub struct StepContext<'a> {
    strand: &'a Strand,
    frame: Frame,
    store: &'a dyn StrandStore,
    registry: &'a ProgRegistry,
    now: DateTime<Utc>,
    effects: StepEffects,
}

impl<'a> StepContext<'a> {
    pub fn new(
        strand: &'a Strand,
        store: &'a dyn StrandStore,
        registry: &'a ProgRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            strand,
            frame: strand.top_frame().cloned().unwrap_or_default(),
            store,
            registry,
            now,
            effects: StepEffects::default(),
        }
    }

    pub fn id(&self) -> StrandId {
        self.strand.id
    }

    pub fn prog(&self) -> &str {
        &self.strand.prog
    }

    pub fn label(&self) -> &str {
        &self.strand.label
    }

    pub fn parent_id(&self) -> Option<StrandId> {
        self.strand.parent_id
    }

    pub fn strand(&self) -> &Strand {
        self.strand
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Working copy of the top frame; persisted with any non-fault result.
    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    pub fn frame_data<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(self.frame.decode()?)
    }

    /// Subject of the top frame; a frame without one is a bug.
    pub fn subject_id(&self) -> Result<StrandId, StepError> {
        self.frame
            .subject_id()
            .ok_or_else(|| StepError::logic(format!("strand {} frame has no subject_id", self.id())))
    }

    pub fn retval(&self) -> Option<&Value> {
        self.frame.retval()
    }

    pub fn retval_msg(&self) -> Option<&str> {
        self.retval()
            .and_then(|v| v.get("msg"))
            .and_then(Value::as_str)
    }

    /// Peeks at a semaphore of this strand.
    pub fn is_set(&self, name: &str) -> Result<bool, StepError> {
        if self.effects.consumed.iter().any(|n| n == name) {
            return Ok(false);
        }
        Ok(self.store.semaphores(self.id())?.iter().any(|n| n == name))
    }

    /// Peeks at a semaphore of another strand.
    pub fn is_set_on(&self, target: StrandId, name: &str) -> Result<bool, StepError> {
        if target == self.id() {
            return self.is_set(name);
        }
        Ok(self.store.semaphores(target)?.iter().any(|n| n == name))
    }

    /// True at most once per pending signal; the consumption is committed
    /// with the step's transition.
    pub fn when_set(&mut self, name: &str) -> Result<bool, StepError> {
        if !self.is_set(name)? {
            return Ok(false);
        }
        self.effects.consumed.push(name.to_string());
        Ok(true)
    }

    /// Consumes a semaphore of this strand, whether set or not.
    pub fn decr(&mut self, name: &str) {
        if !self.effects.consumed.iter().any(|n| n == name) {
            self.effects.consumed.push(name.to_string());
        }
    }

    /// Sets a semaphore on any strand when the step commits.
    pub fn incr(&mut self, target: StrandId, name: &str) {
        self.effects.signals.push((target, name.to_string()));
    }

    pub fn incr_self(&mut self, name: &str) {
        self.incr(self.id(), name);
    }

    /// True when no child strand of this strand exists.
    pub fn leaf(&self) -> Result<bool, StepError> {
        Ok(self.effects.buds.is_empty() && self.store.children(self.id())?.is_empty())
    }

    /// Creates a child strand without parking this one.
    pub fn bud<P: Prog>(&mut self, label: P::Label, mut frame: Frame) -> Result<StrandId, StepError> {
        self.registry.validate_label(P::NAME, label.as_str())?;
        if frame.subject_id().is_none() {
            if let Some(subject) = self.frame.subject_id() {
                frame.set_subject_id(subject);
            }
        }
        let child = NewStrand::child(self.id(), P::NAME, label.as_str(), frame, self.now);
        let id = child.id;
        self.effects.buds.push(child);
        Ok(id)
    }

    /// Registers a deadline in the working frame.
    pub fn register_deadline<L: ProgLabel>(
        &mut self,
        target: Option<L>,
        after: Duration,
        allow_extension: bool,
    ) -> Result<(), StepError> {
        Deadline::register(
            &mut self.frame,
            target.map(|l| l.as_str()),
            after,
            allow_extension,
            self.now,
        )?;
        Ok(())
    }

    pub fn load_strand(&self, id: StrandId) -> Result<Option<Strand>, KernelError> {
        self.store.load(id)
    }

    pub fn into_parts(self) -> (Frame, StepEffects) {
        (self.frame, self.effects)
    }
}
