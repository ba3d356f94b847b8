//! Kernel and step error types.

use crate::kernel::identity::StrandId;

/// Kernel-level error type: storage, registry and frame decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("StrandStore error: {0}")]
    Store(String),
    #[error("strand not found: {0}")]
    StrandNotFound(StrandId),
    #[error("strand already exists: {0}")]
    StrandExists(StrandId),
    /// The commit was fenced off: another worker took the lease over.
    #[error("lease lost for strand {strand_id} (owner {owner}, version {version})")]
    LeaseLost {
        strand_id: StrandId,
        owner: String,
        version: u64,
    },
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("Frame error: {0}")]
    Frame(String),
}

/// Fault raised by a step (or by applying its result).
///
/// Transient faults leave the strand untouched and are retried on the next
/// poll. Logic faults are fatal: retrying cannot help, so the strand is marked
/// failed and surfaces as such in status queries.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Network blip, provider rate limit, resource not ready.
    #[error("transient: {0}")]
    Transient(String),
    /// Missing required frame field, broken invariant, unknown label.
    #[error("BUG: {0}")]
    Logic(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic(message.into())
    }

    /// True when retrying on the next poll cannot change the outcome.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Logic(_) => true,
            Self::Kernel(KernelError::Frame(_) | KernelError::Registry(_)) => true,
            Self::Transient(_) | Self::Kernel(_) => false,
        }
    }
}
