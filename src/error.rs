use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Version conflict writing {0}")]
    VersionConflict(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Unknown job configuration type: {0}")]
    UnknownJobType(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Identity revoked: {0}")]
    RevokedIdentity(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Stale-write errors that the optimistic upsert loop absorbs by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobError::VersionConflict(_) | JobError::AlreadyExists(_))
    }

    /// Errors a job host must surface immediately instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobError::Unauthorized(_) | JobError::RevokedIdentity(_) | JobError::UnknownJobType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_not_fatal() {
        let e = JobError::VersionConflict("job-1".into());
        assert!(e.is_conflict());
        assert!(!e.is_fatal());

        let e = JobError::AlreadyExists("job-1".into());
        assert!(e.is_conflict());
    }

    #[test]
    fn identity_and_type_errors_are_fatal() {
        assert!(JobError::Unauthorized("x".into()).is_fatal());
        assert!(JobError::RevokedIdentity("x".into()).is_fatal());
        assert!(JobError::UnknownJobType("x".into()).is_fatal());
        assert!(!JobError::Transient("x".into()).is_fatal());
        assert!(!JobError::JobNotFound("x".into()).is_fatal());
    }

    #[test]
    fn display_includes_subject() {
        let e = JobError::UnknownJobType("Legacy".into());
        assert_eq!(e.to_string(), "Unknown job configuration type: Legacy");
    }
}
