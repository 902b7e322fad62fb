use thiserror::Error;

/// Errors raised by the election, labeling and instance control layers
#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Pod not found: {name}")]
    PodNotFound { name: String },

    #[error("Metadata store error: {0}")]
    MetadataStore(String),

    #[error("Instance command failed: {command} - {reason}")]
    InstanceCommand { command: String, reason: String },

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("Lease conflict: {details}")]
    LeaseConflict { details: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LeaderError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        LeaderError::ConfigurationError(msg.into())
    }

    pub fn metadata<S: Into<String>>(msg: S) -> Self {
        LeaderError::MetadataStore(msg.into())
    }

    pub fn instance<C: Into<String>, R: Into<String>>(command: C, reason: R) -> Self {
        LeaderError::InstanceCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn lease<S: Into<String>>(msg: S) -> Self {
        LeaderError::Lease(msg.into())
    }

    pub fn lease_conflict<S: Into<String>>(details: S) -> Self {
        LeaderError::LeaseConflict {
            details: details.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        LeaderError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        LeaderError::Internal(msg.into())
    }

    /// Optimistic-concurrency loss on the lease; the elector treats it as "someone else won".
    pub fn is_conflict(&self) -> bool {
        match self {
            LeaderError::LeaseConflict { .. } => true,
            LeaderError::Kube(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

/// Result type for agent operations
pub type LeaderResult<T> = Result<T, LeaderError>;
