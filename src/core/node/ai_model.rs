//! AI model call node.
//!
//! Renders the prompt and context, sends a [`ModelRequest`] to the resolved provider and
//! distills the response into `{text, structured, file, files}`. With `stream` enabled,
//! chunks are accumulated as they arrive; if the stream breaks off, the partial text is
//! kept and the result is marked cancelled.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::{ModelRequest, ModelResponse, ResourceConfig};
use crate::core::result::{ExecutionStatus, NodeExecutionResult};
use crate::core::template::{ResultLookup, stringify};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCallConfig {
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// JSON schema the response should follow.
    #[serde(default)]
    pub structured_output: Option<NodeValue>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AIModelNodeSettings {
    pub prompt: String,
    #[serde(default)]
    pub system_instructions: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    /// Hierarchy references whose `outcome.text` is appended to the context.
    #[serde(default)]
    pub context_sources: Vec<String>,
    #[serde(default)]
    pub model_call_config: ModelCallConfig,
}

impl AIModelNodeSettings {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instructions.push(instruction.into());
        self
    }

    pub fn context_source(mut self, reference: impl Into<String>) -> Self {
        self.context_sources.push(reference.into());
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.model_call_config.stream = stream;
        self
    }
}

pub struct AIModelExecutor;

impl AIModelExecutor {
    fn build_request(
        &self,
        settings: &AIModelNodeSettings,
        context: &ExecutionContext,
        resource: &ResourceConfig,
    ) -> Result<ModelRequest, FlowError> {
        let render_all = |templates: &[String]| {
            templates
                .iter()
                .map(|t| context.render_string(t))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut extra_context = render_all(&settings.context)?;
        for reference in &settings.context_sources {
            match context.hierarchy_value(reference) {
                Some(value) => {
                    let text = value.pointer("/outcome/text").map(stringify).unwrap_or_default();
                    if !text.is_empty() {
                        extra_context.push(text);
                    }
                }
                None => log::warn!("Context source '{reference}' has no recorded result"),
            }
        }

        let config = &settings.model_call_config;
        Ok(ModelRequest {
            model: resource.model_name.clone(),
            system_instructions: render_all(&settings.system_instructions)?,
            context: extra_context,
            prompt: context.render_string(&settings.prompt)?,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            structured_output: config.structured_output.clone(),
        })
    }
}

#[async_trait]
impl NodeExecutor for AIModelExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::AiModelCall(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "ai_model_call executor received other settings".into(),
            });
        };
        let resource = resource.ok_or_else(|| FlowError::InvalidInput {
            node_id: node_id.to_string(),
            message: "no model resource resolved for this node".into(),
        })?;
        let request = self.build_request(settings, context, &resource)?;
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "ai_model_call");
        let provider = &resource.provider;
        log::debug!("Node '{node_id}' calling provider '{}' ({})", provider.name(), resource.profile);

        let (status, response, error) = if settings.model_call_config.stream {
            match provider.stream(request.clone()).await {
                Ok(mut chunks) => {
                    let mut text = String::new();
                    let mut interrupted = None;
                    while let Some(chunk) = chunks.next().await {
                        match chunk {
                            Ok(piece) => text.push_str(&piece),
                            Err(e) => {
                                interrupted = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    let response = ModelResponse {
                        text,
                        ..ModelResponse::default()
                    };
                    match interrupted {
                        None => (ExecutionStatus::Completed, response, None),
                        Some(e) => (ExecutionStatus::Cancelled, response, Some(e)),
                    }
                }
                Err(e) => (ExecutionStatus::Failed, ModelResponse::default(), Some(e.to_string())),
            }
        } else {
            match provider.generate(request.clone()).await {
                Ok(response) => (ExecutionStatus::Completed, response, None),
                Err(e) => (ExecutionStatus::Failed, ModelResponse::default(), Some(e.to_string())),
            }
        };

        let output = json!({
            "request": request,
            "response": response,
        });
        let outcome = json!({
            "text": response.text,
            "structured": response.structured,
            "file": response.files.first(),
            "files": response.files,
        });

        let mut result = result.finish(status, output, outcome);
        if let Some(e) = error {
            log::warn!("Model call for node '{node_id}' ended with {status:?}: {e}");
            result.errors.push(e.clone());
            result.error = Some(e);
        }
        Ok(result)
    }
}
