//! Control plane facade: start strands, signal them, query them.
//!
//! Everything here validates against the [ProgRegistry] before touching the
//! store, so an unknown prog, label or semaphore never reaches a worker.

use std::sync::Arc;

use strand_kernel::{
    Clock, Frame, KernelError, NewStrand, Prog, ProgLabel, ProgRegistry, SemaphoreRegistry,
    Strand, StrandId, StrandStore,
};

use crate::status::{StatusQuery, StrandStatus};

#[derive(Clone)]
pub struct ControlPlane {
    store: Arc<dyn StrandStore>,
    registry: Arc<ProgRegistry>,
    clock: Arc<dyn Clock>,
    semaphores: SemaphoreRegistry,
    status: StatusQuery,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn StrandStore>,
        registry: Arc<ProgRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            semaphores: SemaphoreRegistry::new(store.clone()),
            status: StatusQuery::new(store.clone(), clock.clone()),
            store,
            registry,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn StrandStore> {
        &self.store
    }

    /// Starts a root strand of `P` managing the object `id`.
    pub fn assemble<P: Prog>(
        &self,
        id: StrandId,
        label: P::Label,
        frame: Frame,
    ) -> Result<Strand, KernelError> {
        self.assemble_named(id, P::NAME, label.as_str(), frame)
    }

    pub fn assemble_named(
        &self,
        id: StrandId,
        prog: &str,
        label: &str,
        mut frame: Frame,
    ) -> Result<Strand, KernelError> {
        self.registry.validate_label(prog, label)?;
        if frame.subject_id().is_none() {
            frame.set_subject_id(id);
        }
        let now = self.clock.now();
        let strand = self
            .store
            .create(NewStrand::root(id, prog, label, frame, now), now)?;
        tracing::info!(strand_id = %id, prog, label, "strand assembled");
        Ok(strand)
    }

    /// Sets a semaphore the strand's prog declares.
    pub fn signal(&self, id: StrandId, name: &str) -> Result<(), KernelError> {
        let strand = self.store.get(id)?;
        self.registry.validate_semaphore(&strand.prog, name)?;
        self.semaphores.set(id, name, self.clock.now())
    }

    pub fn semaphores(&self) -> &SemaphoreRegistry {
        &self.semaphores
    }

    pub fn status(&self, id: StrandId) -> Result<Option<StrandStatus>, KernelError> {
        self.status.status(id)
    }

    pub fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError> {
        self.status.children(id)
    }
}
