//! Errors of the private subnet domain.

use strand_kernel::{KernelError, StepError};

use crate::command::CommandError;
use crate::model::{NicId, SubnetId};

#[derive(Debug, thiserror::Error)]
pub enum VnetError {
    #[error("VnetStore error: {0}")]
    Store(String),
    #[error("private subnet not found: {0}")]
    SubnetNotFound(SubnetId),
    #[error("nic not found: {0}")]
    NicNotFound(NicId),
    #[error("nic {0} has no VM placement")]
    NoPlacement(NicId),
    #[error("no tunnel driver registered for provider '{0}'")]
    NoDriver(String),
    #[error("invalid network '{0}'")]
    InvalidNetwork(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Storage and remote command failures are worth retrying; a missing row,
/// driver or placement is not.
impl From<VnetError> for StepError {
    fn from(err: VnetError) -> Self {
        match err {
            VnetError::Store(_) | VnetError::Command(_) => StepError::transient(err.to_string()),
            VnetError::Kernel(inner) => StepError::Kernel(inner),
            VnetError::SubnetNotFound(_)
            | VnetError::NicNotFound(_)
            | VnetError::NoPlacement(_)
            | VnetError::NoDriver(_)
            | VnetError::InvalidNetwork(_) => StepError::logic(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn command_failures_are_retried_and_missing_rows_are_fatal() {
        let failed = VnetError::Command(CommandError::Failed {
            host: "host-1".into(),
            command: "ip xfrm state".into(),
            code: Some(2),
            stderr: "RTNETLINK answers: Operation not permitted".into(),
        });
        assert!(!StepError::from(failed).is_fatal());
        assert!(StepError::from(VnetError::NicNotFound(Uuid::new_v4())).is_fatal());
        assert!(!StepError::from(VnetError::Store("poisoned".into())).is_fatal());
    }
}
