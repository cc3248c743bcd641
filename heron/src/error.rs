use thiserror::Error;

use crate::job::JobId;

/// Errors surfaced by the queue inspector and the admin API.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("job {id} not found in {queue}")]
    NotFound { queue: String, id: JobId },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl AdminError {
    pub fn not_found(queue: impl Into<String>, id: &JobId) -> Self {
        Self::NotFound {
            queue: queue.into(),
            id: id.clone(),
        }
    }
}

pub type AdminResult<T> = Result<T, AdminError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = AdminError::not_found("dead-letter-queue", &JobId::from("dlq-1-2"));
        assert_eq!(err.to_string(), "job dlq-1-2 not found in dead-letter-queue");

        let err = AdminError::PreconditionFailed("confirm=true required".into());
        assert_eq!(err.to_string(), "precondition failed: confirm=true required");

        let err: AdminError = anyhow::anyhow!("connection refused").into();
        assert_eq!(err.to_string(), "connection refused");
    }
}
