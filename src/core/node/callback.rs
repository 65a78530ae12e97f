//! User callbacks invoked from flow nodes.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};

use crate::core::NodeValue;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::ResourceConfig;
use crate::core::result::NodeExecutionResult;

/// Any error a callback chooses to raise.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub type CallbackArgs = Map<String, NodeValue>;

#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, args: CallbackArgs) -> Result<NodeValue, CallbackError>;
}

/// Adapts a synchronous closure.
pub struct FnCallback<F>(pub F);

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(CallbackArgs) -> Result<NodeValue, CallbackError> + Send + Sync,
{
    async fn call(&self, args: CallbackArgs) -> Result<NodeValue, CallbackError> {
        (self.0)(args)
    }
}

/// Adapts a closure returning a future.
pub struct AsyncFnCallback<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnCallback<F, Fut> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Callback for AsyncFnCallback<F, Fut>
where
    F: Fn(CallbackArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeValue, CallbackError>> + Send,
{
    async fn call(&self, args: CallbackArgs) -> Result<NodeValue, CallbackError> {
        (self.f)(args).await
    }
}

/// Callbacks keyed by name, owned by the run context.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn Callback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callback: Arc<dyn Callback>) {
        let name = name.into();
        if self.callbacks.contains_key(&name) {
            log::warn!("Callback '{name}' was already registered, overwriting.");
        }
        self.callbacks.insert(name, callback);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(CallbackArgs) -> Result<NodeValue, CallbackError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnCallback(f)));
    }

    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(CallbackArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeValue, CallbackError>> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncFnCallback::new(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Callback>> {
        self.callbacks.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSettings {
    /// Name in the run's callback registry.
    pub callback: String,
    #[serde(default)]
    pub args: CallbackArgs,
    /// Rendered before the call; rendered values win over `args`.
    #[serde(default)]
    pub template_args: CallbackArgs,
}

impl CallbackSettings {
    pub fn new(callback: impl Into<String>) -> Self {
        Self {
            callback: callback.into(),
            args: Map::new(),
            template_args: Map::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: NodeValue) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn template_arg(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.template_args.insert(name.into(), NodeValue::String(template.into()));
        self
    }
}

pub struct CallbackExecutor;

#[async_trait]
impl NodeExecutor for CallbackExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::Callback(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "callback executor received other settings".into(),
            });
        };
        let callback = context
            .run()
            .callbacks()
            .get(&settings.callback)
            .ok_or_else(|| FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: format!("no callback registered as '{}'", settings.callback),
            })?;
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "callback");

        let mut args = settings.args.clone();
        for (name, template) in &settings.template_args {
            args.insert(name.clone(), context.render_value(template)?);
        }
        let output = json!({ "args": args.clone() });

        match callback.call(args).await {
            Ok(value) => Ok(result.completed(output, value)),
            Err(e) => {
                log::warn!("Callback '{}' for node '{node_id}' raised: {e}", settings.callback);
                Ok(result.failed(format!("callback '{}' failed: {e}", settings.callback)))
            }
        }
    }
}
