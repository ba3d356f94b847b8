//! Semaphore registry: external signalling into strands.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::kernel::error::KernelError;
use crate::kernel::identity::StrandId;
use crate::kernel::store::StrandStore;

/// Signals outside of a step. Inside a step use the buffered
/// `StepContext::incr` / `StepContext::when_set` instead.
#[derive(Clone)]
pub struct SemaphoreRegistry {
    store: Arc<dyn StrandStore>,
}

impl SemaphoreRegistry {
    pub fn new(store: Arc<dyn StrandStore>) -> Self {
        Self { store }
    }

    /// Idempotent; repeated sets before a consume count once.
    pub fn set(&self, strand_id: StrandId, name: &str, now: DateTime<Utc>) -> Result<(), KernelError> {
        self.store.set_semaphore(strand_id, name, now)?;
        tracing::debug!(strand_id = %strand_id, semaphore = name, "semaphore set");
        Ok(())
    }

    pub fn list(&self, strand_id: StrandId) -> Result<Vec<String>, KernelError> {
        self.store.semaphores(strand_id)
    }

    pub fn consume(&self, strand_id: StrandId, name: &str) -> Result<bool, KernelError> {
        self.store.consume_semaphore(strand_id, name)
    }
}
