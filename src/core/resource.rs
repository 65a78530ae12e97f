//! Resources are external capabilities (model endpoints) selected by query.
//!
//! Nodes carry a list of [`ResourceQuery`]s; a [`ResourceResolver`] turns that list into
//! a concrete [`ResourceConfig`]. The bundled resolver is [`ResourceRegistry`], a table of
//! named [`ModelProvider`] profiles.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::NodeValue;
use crate::core::error::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    AiModelEndpoint,
    AiModel,
}

/// One entry of a node's resource list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub item_type: ResourceType,
    #[serde(default)]
    pub query: BTreeMap<String, NodeValue>,
    #[serde(default)]
    pub is_default: bool,
}

impl ResourceQuery {
    /// Selects a registered profile by name.
    pub fn profile(name: impl Into<String>) -> Self {
        Self {
            item_type: ResourceType::AiModelEndpoint,
            query: BTreeMap::from([("profile".to_string(), NodeValue::String(name.into()))]),
            is_default: false,
        }
    }

    /// Selects a model by name, served by a profile of the same name or the default one.
    pub fn model(name: impl Into<String>) -> Self {
        Self {
            item_type: ResourceType::AiModelEndpoint,
            query: BTreeMap::from([("model_name".to_string(), NodeValue::String(name.into()))]),
            is_default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.query.get(key).and_then(NodeValue::as_str)
    }
}

/// Checks that at most one entry is marked `is_default`.
pub fn validate_resources(resources: &[ResourceQuery]) -> Result<(), String> {
    let defaults = resources.iter().filter(|r| r.is_default).count();
    if defaults > 1 {
        return Err(format!(
            "{defaults} resources are marked is_default; at most one is allowed"
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// A provider-neutral model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub system_instructions: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    pub prompt: String,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// JSON schema the response should follow, if any.
    pub structured_output: Option<NodeValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub structured: Option<NodeValue>,
    #[serde(default)]
    pub files: Vec<NodeValue>,
    #[serde(default)]
    pub usage: Option<NodeValue>,
}

/// A model backend. Request and response payloads are opaque to the engine.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError>;

    /// Streams text chunks. The default yields the full response as a single chunk.
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<String, ProviderError>>, ProviderError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(response.text)])))
    }
}

/// A resolved resource handed to an executor.
#[derive(Clone)]
pub struct ResourceConfig {
    pub profile: String,
    pub model_name: Option<String>,
    pub provider: Arc<dyn ModelProvider>,
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("profile", &self.profile)
            .field("model_name", &self.model_name)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Turns a node's resource list into a concrete resource.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, resources: &[ResourceQuery]) -> Result<Option<ResourceConfig>, FlowError>;
}

#[derive(Default)]
struct Profiles {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    order: Vec<String>,
}

/// Named provider profiles. Registration is first-writer-wins.
#[derive(Default)]
pub struct ResourceRegistry {
    profiles: RwLock<Profiles>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under `name`. Returns `false` if the name was already taken,
    /// in which case the existing profile is kept.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) -> bool {
        let name = name.into();
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.providers.contains_key(&name) {
            log::warn!("Resource profile '{name}' is already registered; keeping the first.");
            return false;
        }
        profiles.order.push(name.clone());
        profiles.providers.insert(name, provider);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelProvider>> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .get(name)
            .cloned()
    }

    /// The first registered profile.
    pub fn default_profile(&self) -> Option<(String, Arc<dyn ModelProvider>)> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        let name = profiles.order.first()?;
        profiles
            .providers
            .get(name)
            .map(|provider| (name.clone(), Arc::clone(provider)))
    }

    pub fn is_empty(&self) -> bool {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .is_empty()
    }
}

impl ResourceResolver for ResourceRegistry {
    fn resolve(&self, resources: &[ResourceQuery]) -> Result<Option<ResourceConfig>, FlowError> {
        validate_resources(resources).map_err(FlowError::Validation)?;

        let chosen = resources
            .iter()
            .find(|r| r.is_default)
            .or_else(|| resources.first());

        let Some(query) = chosen else {
            return Ok(self.default_profile().map(|(profile, provider)| ResourceConfig {
                profile,
                model_name: None,
                provider,
            }));
        };

        let model_name = query.text("model_name").map(str::to_string);
        if let Some(profile) = query.text("profile") {
            let provider = self
                .get(profile)
                .ok_or_else(|| FlowError::ResourceNotFound(format!("profile '{profile}'")))?;
            return Ok(Some(ResourceConfig {
                profile: profile.to_string(),
                model_name,
                provider,
            }));
        }

        if let Some(model) = model_name.as_deref() {
            if let Some(provider) = self.get(model) {
                return Ok(Some(ResourceConfig {
                    profile: model.to_string(),
                    model_name,
                    provider,
                }));
            }
        }

        let (profile, provider) = self
            .default_profile()
            .ok_or_else(|| FlowError::ResourceNotFound(format!("{:?}", query.query)))?;
        Ok(Some(ResourceConfig {
            profile,
            model_name,
            provider,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ModelProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
            Ok(ModelResponse {
                text: format!("{}:{}", self.0, request.prompt),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_two_defaults_fail_validation() {
        let resources = vec![
            ResourceQuery::model("a").as_default(),
            ResourceQuery::model("b").as_default(),
        ];
        assert!(validate_resources(&resources).is_err());
        assert!(validate_resources(&resources[..1]).is_ok());
    }

    #[test]
    fn test_registration_is_first_writer_wins() {
        let registry = ResourceRegistry::new();
        assert!(registry.register("main", Arc::new(Named("first"))));
        assert!(!registry.register("main", Arc::new(Named("second"))));
        assert_eq!(registry.get("main").unwrap().name(), "first");
    }

    #[test]
    fn test_resolve_prefers_default_entry() {
        let registry = ResourceRegistry::new();
        registry.register("fast", Arc::new(Named("fast")));
        registry.register("smart", Arc::new(Named("smart")));

        let resources = vec![ResourceQuery::profile("fast"), ResourceQuery::profile("smart").as_default()];
        let resolved = registry.resolve(&resources).unwrap().unwrap();
        assert_eq!(resolved.profile, "smart");

        let by_model = registry.resolve(&[ResourceQuery::model("gpt-x")]).unwrap().unwrap();
        assert_eq!(by_model.profile, "fast");
        assert_eq!(by_model.model_name.as_deref(), Some("gpt-x"));

        assert!(matches!(
            registry.resolve(&[ResourceQuery::profile("missing")]),
            Err(FlowError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_default_stream_yields_whole_response() {
        use futures::StreamExt;

        let provider = Named("p");
        let mut chunks = provider
            .stream(ModelRequest {
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(chunks.next().await.unwrap().unwrap(), "p:hi");
        assert!(chunks.next().await.is_none());
    }
}
