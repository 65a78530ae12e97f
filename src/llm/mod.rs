//! Model provider adapters.
//!
//! Each adapter implements [`ModelProvider`](crate::core::resource::ModelProvider) so it
//! can be registered as a profile in a [`ResourceRegistry`](crate::core::resource::ResourceRegistry).

pub mod error;
pub mod ollama;

pub use error::LLMError;
pub use ollama::{OllamaConfig, OllamaProvider};
