use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobWorkerError {
    #[error("invalid status transition for job {0}")]
    InvalidState(String),

    #[error("failed preparing job {job_id}: {reason}")]
    PreparationFailed { job_id: String, reason: String },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job id already in use: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl JobWorkerError {
    /// Wrap an `io::Error` with the operation and path that produced it.
    /// Used as `map_err(JobWorkerError::io(format!("opening {path}")))`.
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| JobWorkerError::Io { context, source }
    }
}

impl From<JobWorkerError> for tonic::Status {
    fn from(err: JobWorkerError) -> Self {
        match &err {
            JobWorkerError::InvalidState(_) => tonic::Status::failed_precondition(err.to_string()),
            JobWorkerError::NotFound(_) => tonic::Status::not_found(err.to_string()),
            JobWorkerError::AlreadyExists(_) => tonic::Status::already_exists(err.to_string()),
            JobWorkerError::PermissionDenied(_) => tonic::Status::permission_denied(err.to_string()),
            JobWorkerError::PreparationFailed { .. } | JobWorkerError::Io { .. } => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, JobWorkerError>;
