//! Prog definitions and the registration table.
//!
//! A Prog is a type with a label enum and one exhaustive `run` match, so a
//! label without a step does not compile. Progs are registered into an
//! explicit [ProgRegistry] value at startup and handed to the dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::kernel::context::StepContext;
use crate::kernel::error::{KernelError, StepError};
use crate::kernel::step::{StepOutcome, StepResult};

/// Label enum of a Prog.
pub trait ProgLabel: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every label, in declaration order.
    const ALL: &'static [Self];
    /// Label a new strand of this Prog starts at.
    const START: Self;

    fn as_str(&self) -> &'static str;

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|label| label.as_str() == name)
    }
}

/// A workflow type.
pub trait Prog: Send + Sync + 'static {
    type Label: ProgLabel;

    /// Registered name, e.g. `Vnet::SubnetNexus`.
    const NAME: &'static str;
    /// Semaphore names this Prog reacts to.
    const SEMAPHORES: &'static [&'static str] = &[];

    /// Runs before every step. Returning a result short-circuits the step.
    fn before_run(
        &self,
        _label: Self::Label,
        _ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError> {
        Ok(None)
    }

    fn run(&self, label: Self::Label, ctx: &mut StepContext<'_>) -> StepOutcome;
}

/// Object-safe view of a registered Prog.
pub trait RegisteredProg: Send + Sync {
    fn name(&self) -> &'static str;
    fn labels(&self) -> Vec<&'static str>;
    fn start_label(&self) -> &'static str;
    fn semaphores(&self) -> &'static [&'static str];
    fn before_run(
        &self,
        label: &str,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError>;
    fn run(&self, label: &str, ctx: &mut StepContext<'_>) -> StepOutcome;
}

struct ProgEntry<P: Prog>(P);

impl<P: Prog> ProgEntry<P> {
    fn label(&self, label: &str) -> Result<P::Label, StepError> {
        P::Label::parse(label)
            .ok_or_else(|| StepError::logic(format!("unknown label {label} for {}", P::NAME)))
    }
}

impl<P: Prog> RegisteredProg for ProgEntry<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn labels(&self) -> Vec<&'static str> {
        P::Label::ALL.iter().map(|l| l.as_str()).collect()
    }

    fn start_label(&self) -> &'static str {
        P::Label::START.as_str()
    }

    fn semaphores(&self) -> &'static [&'static str] {
        P::SEMAPHORES
    }

    fn before_run(
        &self,
        label: &str,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError> {
        let label = self.label(label)?;
        self.0.before_run(label, ctx)
    }

    fn run(&self, label: &str, ctx: &mut StepContext<'_>) -> StepOutcome {
        let label = self.label(label)?;
        self.0.run(label, ctx)
    }
}

/// Frozen name -> Prog table.
#[derive(Clone, Default)]
pub struct ProgRegistry {
    progs: HashMap<&'static str, Arc<dyn RegisteredProg>>,
}

#[derive(Default)]
pub struct ProgRegistryBuilder {
    progs: HashMap<&'static str, Arc<dyn RegisteredProg>>,
}

impl ProgRegistryBuilder {
    /// Adds a Prog. Registering the same name twice is an error.
    pub fn register<P: Prog>(mut self, prog: P) -> Result<Self, KernelError> {
        if self.progs.contains_key(P::NAME) {
            return Err(KernelError::Registry(format!(
                "prog {} registered twice",
                P::NAME
            )));
        }
        self.progs.insert(P::NAME, Arc::new(ProgEntry(prog)));
        Ok(self)
    }

    pub fn build(self) -> ProgRegistry {
        ProgRegistry { progs: self.progs }
    }
}

impl ProgRegistry {
    pub fn builder() -> ProgRegistryBuilder {
        ProgRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RegisteredProg>, KernelError> {
        self.progs
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::Registry(format!("unknown prog {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.progs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.progs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn validate_label(&self, prog: &str, label: &str) -> Result<(), KernelError> {
        let entry = self.get(prog)?;
        if entry.labels().contains(&label) {
            Ok(())
        } else {
            Err(KernelError::Registry(format!(
                "prog {prog} has no label {label}"
            )))
        }
    }

    pub fn validate_semaphore(&self, prog: &str, name: &str) -> Result<(), KernelError> {
        let entry = self.get(prog)?;
        if entry.semaphores().contains(&name) {
            Ok(())
        } else {
            Err(KernelError::Registry(format!(
                "prog {prog} does not declare semaphore {name}"
            )))
        }
    }
}

impl fmt::Debug for ProgRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgRegistry")
            .field("progs", &self.names())
            .finish()
    }
}
