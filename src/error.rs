use crate::collaborators::CollaboratorError;
use crate::sanction::SanctionState;
use crate::types::{ArtifactId, SanctionId, UserId};

#[derive(thiserror::Error, Debug)]
pub enum SanctionError {
    #[error("{authorizer} is not an authorizer on sanction {sanction_id}")]
    Permissions {
        sanction_id: SanctionId,
        authorizer: UserId,
    },
    #[error("invalid approval token presented for sanction {sanction_id}")]
    InvalidApprovalToken { sanction_id: SanctionId },
    #[error("invalid rejection token presented for sanction {sanction_id}")]
    InvalidRejectionToken { sanction_id: SanctionId },
    #[error("sanction {sanction_id} is {state}, cannot {action}")]
    InvalidState {
        sanction_id: SanctionId,
        state: SanctionState,
        action: &'static str,
    },
    #[error("artifact {artifact_id} blocks the transition: {reason}")]
    ArtifactState {
        artifact_id: ArtifactId,
        reason: String,
    },
    #[error("{} artifact(s) under {root} failed to update", failed.len())]
    CascadeFailure {
        root: ArtifactId,
        failed: Vec<(ArtifactId, String)>,
    },
    #[error("sanction {0} does not exist")]
    NotFound(SanctionId),
    #[error("sanction {0} kept changing under concurrent writers")]
    Contention(SanctionId),
    #[error("failed to encode sanction record: {0}")]
    Encode(String),
    #[error("failed to decode sanction record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SanctionError {
    /// Errors a link handler should render as "this link is invalid or has expired"
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            SanctionError::Permissions { .. }
                | SanctionError::InvalidApprovalToken { .. }
                | SanctionError::InvalidRejectionToken { .. }
                | SanctionError::NotFound(_)
        )
    }
}

pub type SanctionResult<T> = Result<T, SanctionError>;
