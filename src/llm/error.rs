use thiserror::Error;

use crate::core::resource::ProviderError;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Ollama error: {0}")]
    OllamaError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<LLMError> for ProviderError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::InvalidResponse(msg) => ProviderError::InvalidResponse(msg),
            LLMError::SerializationError(e) => ProviderError::InvalidResponse(e.to_string()),
            other => ProviderError::Request(other.to_string()),
        }
    }
}
