use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreaggError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("compute error: {message}")]
    Compute { message: String },
    #[error("timed out: {message}")]
    Timeout { message: String },
}

impl PreaggError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }
}

pub type PreaggResult<T> = Result<T, PreaggError>;

impl From<sea_orm::DbErr> for PreaggError {
    fn from(value: sea_orm::DbErr) -> Self {
        PreaggError::storage(value.to_string())
    }
}
