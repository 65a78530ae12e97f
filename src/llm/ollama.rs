//! Ollama chat adapter for local inference

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::resource::{ModelProvider, ModelRequest, ModelResponse, ProviderError};
use crate::llm::error::LLMError;

/// Configuration for the Ollama adapter
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama server URL (default: http://localhost:11434)
    pub host: String,
    /// Model used when the resource names none (default: phi4)
    pub default_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            default_model: "phi4".to_string(),
        }
    }
}

/// Request structure for Ollama chat completions
#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
    /// `"json"` or a JSON schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<NodeValue>,
}

/// A message in Ollama's chat format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

impl OllamaMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Options for Ollama generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// Response from Ollama's chat endpoint; one line of a streamed reply
#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub message: OllamaMessage,
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: u32,
    #[serde(default)]
    pub eval_count: u32,
}

/// Serves model calls from an Ollama server.
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn at(host: impl Into<String>) -> Self {
        Self::new(OllamaConfig {
            host: host.into(),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Maps a provider-neutral request onto Ollama's chat format.
    pub fn chat_request(&self, request: &ModelRequest, stream: bool) -> OllamaChatRequest {
        let mut messages: Vec<OllamaMessage> = request
            .system_instructions
            .iter()
            .map(OllamaMessage::system)
            .collect();
        messages.extend(request.context.iter().map(OllamaMessage::user));
        messages.push(OllamaMessage::user(&request.prompt));

        let options = (request.temperature.is_some() || request.max_output_tokens.is_some()).then(|| OllamaOptions {
            temperature: request.temperature,
            num_predict: request.max_output_tokens,
        });

        OllamaChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages,
            stream,
            options,
            format: request.structured_output.clone(),
        }
    }

    async fn send(&self, request: &OllamaChatRequest) -> Result<reqwest::Response, LLMError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.config.host))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::OllamaError(format!("HTTP {status}: {error_text}")));
        }
        Ok(response)
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(OllamaConfig::default())
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        let chat = self.chat_request(&request, false);
        let response: OllamaChatResponse = self
            .send(&chat)
            .await?
            .json()
            .await
            .map_err(LLMError::from)?;

        let text = response.message.content;
        let structured = match request.structured_output {
            Some(_) => Some(serde_json::from_str(&text).map_err(LLMError::from)?),
            None => None,
        };
        Ok(ModelResponse {
            text,
            structured,
            files: Vec::new(),
            usage: Some(json!({
                "model": response.model,
                "prompt_tokens": response.prompt_eval_count,
                "completion_tokens": response.eval_count,
            })),
        })
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<String, ProviderError>>, ProviderError> {
        let chat = self.chat_request(&request, true);
        let bytes = self.send(&chat).await?.bytes_stream().boxed();

        let state = (bytes, String::new(), VecDeque::<String>::new(), false);
        let chunks = stream::unfold(state, |(mut bytes, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (bytes, buffer, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(data)) => {
                        buffer.push_str(&String::from_utf8_lossy(&data));
                        while let Some(newline) = buffer.find('\n') {
                            let line: String = buffer.drain(..=newline).collect();
                            match parse_stream_line(line.trim()) {
                                Ok(Some((content, finished))) => {
                                    if !content.is_empty() {
                                        pending.push_back(content);
                                    }
                                    done |= finished;
                                }
                                Ok(None) => {}
                                Err(e) => return Some((Err(e), (bytes, buffer, pending, true))),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = ProviderError::Interrupted(e.to_string());
                        return Some((Err(err), (bytes, buffer, pending, true)));
                    }
                    None => {
                        done = true;
                        if let Ok(Some((content, _))) = parse_stream_line(buffer.trim()) {
                            if !content.is_empty() {
                                pending.push_back(content);
                            }
                        }
                        buffer.clear();
                    }
                }
            }
        });
        Ok(chunks.boxed())
    }
}

/// Parses one NDJSON line of a streamed chat reply into `(content, done)`.
fn parse_stream_line(line: &str) -> Result<Option<(String, bool)>, ProviderError> {
    if line.is_empty() {
        return Ok(None);
    }
    let response: OllamaChatResponse =
        serde_json::from_str(line).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    Ok(Some((response.message.content, response.done)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost:11434");
        assert_eq!(config.default_model, "phi4");
    }

    #[test]
    fn test_chat_request_mapping() {
        let provider = OllamaProvider::default();
        let request = ModelRequest {
            system_instructions: vec!["be brief".into()],
            context: vec!["earlier answer".into()],
            prompt: "summarize".into(),
            temperature: Some(0.2),
            ..Default::default()
        };
        let chat = provider.chat_request(&request, true);
        assert_eq!(chat.model, "phi4");
        assert!(chat.stream);
        let roles: Vec<&str> = chat.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user"]);
        assert_eq!(chat.messages[2].content, "summarize");
        assert_eq!(chat.options.unwrap().temperature, Some(0.2));
    }

    #[test]
    fn test_parse_stream_line() {
        let line = r#"{"model":"phi4","created_at":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        assert_eq!(parse_stream_line(line).unwrap(), Some(("Hel".to_string(), false)));
        assert_eq!(parse_stream_line("").unwrap(), None);
        assert!(parse_stream_line("{not json").is_err());
    }
}
