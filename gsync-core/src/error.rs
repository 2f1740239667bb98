//! Error taxonomy for cluster coordination and collective operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("worker '{id}' is already registered")]
    Conflict { id: String },

    #[error("{what} {value} exceeds the 32-bit wire range")]
    Range { what: &'static str, value: i64 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{stage} failed: {message}")]
    Collective {
        stage: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

// Convenience constructors
impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    pub fn range(what: &'static str, value: i64) -> Self {
        Self::Range { what, value }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn collective(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Collective {
            stage,
            message: message.into(),
        }
    }
}

impl From<SyncError> for tonic::Status {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::Validation { .. } => tonic::Status::invalid_argument(err.to_string()),
            SyncError::NotFound { .. } => tonic::Status::not_found(err.to_string()),
            SyncError::Conflict { .. } => tonic::Status::already_exists(err.to_string()),
            SyncError::Range { .. } => tonic::Status::out_of_range(err.to_string()),
            SyncError::Transport { .. } => tonic::Status::unavailable(err.to_string()),
            SyncError::Collective { .. } => tonic::Status::internal(err.to_string()),
        }
    }
}
