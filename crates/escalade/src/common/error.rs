use thiserror::Error;

use crate::common::error::EscError::GenericError;

#[derive(Debug, Error)]
pub enum EscError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Scheduler error: {0}")]
    SchedulerError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_yaml::Error> for EscError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<serde_json::error::Error> for EscError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for EscError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for EscError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
