use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service unavailable: {message}")]
    Unavailable { message: String },

    #[error("conversation not found: {id}")]
    NotFound { id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
