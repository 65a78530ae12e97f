//! Node definitions and executors.
//!
//! A node pairs an id with a [`NodeDefinition`]: pure data describing one step. The work
//! itself is done by the [`NodeExecutor`] registered for the definition's node type.

pub mod ai_model;
pub mod basic_agent;
pub mod callback;
pub mod command;
pub mod file_operation;
pub mod folder_analyzer;
pub mod git_repo_analyzer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::NodeValue;
use crate::core::component::ComponentDefinition;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::events::{Event, EventType};
use crate::core::recorder::{GitSettings, NodeRecordSettings, RecordType};
use crate::core::resource::{ResourceConfig, ResourceQuery, validate_resources};
use crate::core::result::NodeExecutionResult;
use crate::core::template::Bindings;

pub use ai_model::{AIModelExecutor, AIModelNodeSettings, ModelCallConfig};
pub use basic_agent::{BasicAgentExecutor, BasicAgentSettings};
pub use callback::{Callback, CallbackError, CallbackExecutor, CallbackRegistry, CallbackSettings};
pub use command::{CommandExecutor, CommandSettings};
pub use file_operation::{FileModification, FileOperation, FileOperationExecutor, FileOperationSettings};
pub use folder_analyzer::{FolderAnalyzerExecutor, FolderAnalyzerSettings, FolderOperation, OperationType};
pub use git_repo_analyzer::{GitRepoAnalyzerExecutor, GitRepoAnalyzerSettings};

/// Externally supplied input for a node, either from the run's static inputs or from an
/// answered input request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    /// Extra template variables visible while the node runs.
    #[serde(default)]
    pub variables: Bindings,
    /// Extra environment variables for command nodes. They win over the settings.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl NodeInput {
    pub fn with_variable(mut self, name: impl Into<String>, value: NodeValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(name.into(), value.into());
        self
    }
}

/// Registry keys of the executors every run starts with.
pub const BUILTIN_NODE_TYPES: &[&str] = &[
    "ai_model_call",
    "command",
    "folder_analyzer",
    "file_operation",
    "git_repo_analyzer",
    "callback",
    "basic_agent",
];

/// Settings of a user executor registered by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSettings {
    pub executor: String,
    #[serde(default)]
    pub settings: NodeValue,
}

/// Type-specific node configuration, tagged by `node_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeSettings {
    AiModelCall(AIModelNodeSettings),
    Command(CommandSettings),
    FolderAnalyzer(FolderAnalyzerSettings),
    FileOperation(FileOperationSettings),
    GitRepoAnalyzer(GitRepoAnalyzerSettings),
    Callback(CallbackSettings),
    Custom(CustomSettings),
    BasicAgent(BasicAgentSettings),
}

impl NodeSettings {
    /// The executor registry key for these settings.
    pub fn node_type(&self) -> &str {
        match self {
            NodeSettings::AiModelCall(_) => "ai_model_call",
            NodeSettings::Command(_) => "command",
            NodeSettings::FolderAnalyzer(_) => "folder_analyzer",
            NodeSettings::FileOperation(_) => "file_operation",
            NodeSettings::GitRepoAnalyzer(_) => "git_repo_analyzer",
            NodeSettings::Callback(_) => "callback",
            NodeSettings::Custom(custom) => &custom.executor,
            NodeSettings::BasicAgent(_) => "basic_agent",
        }
    }
}

/// Configuration of one step. Stateless and reusable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub settings: NodeSettings,
    #[serde(default)]
    pub resources: Vec<ResourceQuery>,
    /// Events published before the node runs. Only `node_input_required` has an effect.
    #[serde(default)]
    pub pre_events: Vec<EventType>,
    #[serde(default)]
    pub record_settings: NodeRecordSettings,
    #[serde(default)]
    pub git_settings: Option<GitSettings>,
    /// Abort the enclosing component when this node's result is unsuccessful.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl NodeDefinition {
    pub fn new(settings: impl Into<NodeSettings>) -> Self {
        Self {
            settings: settings.into(),
            resources: Vec::new(),
            pre_events: Vec::new(),
            record_settings: NodeRecordSettings::default(),
            git_settings: None,
            fail_fast: false,
            description: None,
        }
    }

    pub fn custom(executor: impl Into<String>, settings: NodeValue) -> Self {
        Self::new(NodeSettings::Custom(CustomSettings {
            executor: executor.into(),
            settings,
        }))
    }

    pub fn with_resource(mut self, resource: ResourceQuery) -> Self {
        self.resources.push(resource);
        self
    }

    /// Publishes `node_input_required` before the node runs.
    pub fn requires_input(mut self) -> Self {
        if !self.pre_events.contains(&EventType::NodeInputRequired) {
            self.pre_events.push(EventType::NodeInputRequired);
        }
        self
    }

    pub fn with_record_settings(mut self, record_settings: NodeRecordSettings) -> Self {
        self.record_settings = record_settings;
        self
    }

    pub fn with_git_settings(mut self, git_settings: GitSettings) -> Self {
        self.git_settings = Some(git_settings);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn node_type(&self) -> &str {
        self.settings.node_type()
    }

    pub fn needs_input(&self) -> bool {
        self.pre_events.contains(&EventType::NodeInputRequired)
    }

    /// Construction-time checks. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = validate_resources(&self.resources) {
            problems.push(e);
        }
        match &self.settings {
            NodeSettings::Command(settings) if settings.commands.is_empty() => {
                problems.push("command node has no commands".to_string());
            }
            NodeSettings::AiModelCall(settings) if settings.prompt.trim().is_empty() => {
                problems.push("ai_model_call node has an empty prompt".to_string());
            }
            NodeSettings::Callback(settings) if settings.callback.trim().is_empty() => {
                problems.push("callback node names no callback".to_string());
            }
            NodeSettings::FileOperation(settings)
                if settings.operations.is_empty() && settings.operations_template.is_none() =>
            {
                problems.push("file_operation node has no operations".to_string());
            }
            NodeSettings::Custom(settings) if settings.executor.trim().is_empty() => {
                problems.push("custom node names no executor".to_string());
            }
            NodeSettings::Custom(settings) if BUILTIN_NODE_TYPES.contains(&settings.executor.as_str()) => {
                problems.push(format!(
                    "custom executor '{}' shadows a built-in node type",
                    settings.executor
                ));
            }
            _ => {}
        }
        problems
    }
}

impl From<CommandSettings> for NodeSettings {
    fn from(settings: CommandSettings) -> Self {
        NodeSettings::Command(settings)
    }
}

impl From<AIModelNodeSettings> for NodeSettings {
    fn from(settings: AIModelNodeSettings) -> Self {
        NodeSettings::AiModelCall(settings)
    }
}

impl From<FolderAnalyzerSettings> for NodeSettings {
    fn from(settings: FolderAnalyzerSettings) -> Self {
        NodeSettings::FolderAnalyzer(settings)
    }
}

impl From<FileOperationSettings> for NodeSettings {
    fn from(settings: FileOperationSettings) -> Self {
        NodeSettings::FileOperation(settings)
    }
}

impl From<GitRepoAnalyzerSettings> for NodeSettings {
    fn from(settings: GitRepoAnalyzerSettings) -> Self {
        NodeSettings::GitRepoAnalyzer(settings)
    }
}

impl From<CallbackSettings> for NodeSettings {
    fn from(settings: CallbackSettings) -> Self {
        NodeSettings::Callback(settings)
    }
}

impl From<BasicAgentSettings> for NodeSettings {
    fn from(settings: BasicAgentSettings) -> Self {
        NodeSettings::BasicAgent(settings)
    }
}

impl From<ComponentDefinition> for NodeSettings {
    fn from(flow: ComponentDefinition) -> Self {
        NodeSettings::BasicAgent(BasicAgentSettings { flow })
    }
}

/// Performs the work of one node type.
///
/// Execution failures (non-zero exit codes, provider errors) belong in the returned
/// result. An `Err` means the node could not run at all, typically invalid settings.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// # Arguments
    /// * `node_id` - The node's id within its component
    /// * `definition` - The node's configuration
    /// * `context` - The enclosing component's context, positioned on this node
    /// * `input` - External input, if the node asked for or was given one
    /// * `resource` - The resolved resource, if the node declared any
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        input: Option<NodeInput>,
        resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError>;
}

/// Executors keyed by node type name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding an executor for every built-in node type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ai_model_call", Arc::new(AIModelExecutor));
        registry.register("command", Arc::new(CommandExecutor));
        registry.register("folder_analyzer", Arc::new(FolderAnalyzerExecutor));
        registry.register("file_operation", Arc::new(FileOperationExecutor));
        registry.register("git_repo_analyzer", Arc::new(GitRepoAnalyzerExecutor));
        registry.register("callback", Arc::new(CallbackExecutor));
        registry.register("basic_agent", Arc::new(BasicAgentExecutor));
        registry
    }

    /// Registers `executor` for `node_type`, replacing (with a warning) any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        let node_type = node_type.into();
        if self.executors.contains_key(&node_type) {
            log::warn!("Executor for node type '{node_type}' was already registered, overwriting.");
        }
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }
}

/// Runs one node inside `context`: input acquisition, resource resolution, events,
/// execution and recording.
pub(crate) async fn run_node(
    node_id: &str,
    definition: &NodeDefinition,
    context: &mut ExecutionContext,
) -> Result<NodeExecutionResult, FlowError> {
    let run = Arc::clone(context.run());
    let node_type = definition.node_type().to_string();
    let node_hier = context.child_hier(node_id);

    let executor = run
        .executors()
        .get(&node_type)
        .ok_or_else(|| FlowError::ExecutorNotFound(node_type.clone()))?;

    let input = match run.static_input(node_id, &node_hier) {
        Some(input) => Some(input),
        None if definition.needs_input() => {
            run.events()
                .request_input(node_id, &node_hier, &node_type)
                .await
        }
        None => None,
    };

    let resource = run.resources().resolve(&definition.resources)?;

    context.enter_node(node_id, input.as_ref().map(|i| &i.variables));
    run.events()
        .publish(Event::notify(
            EventType::NodeExecutionStart,
            node_id,
            &node_hier,
            serde_json::json!({ "node_type": node_type }),
        ))
        .await;

    let input_value = input.as_ref().map(serde_json::to_value).transpose()?;
    let executed = executor
        .execute_node(node_id, definition, context, input, resource)
        .await;

    let result = match executed {
        Ok(result) => result,
        Err(FlowError::Render(e)) => {
            log::warn!("Node '{node_hier}' could not render its settings: {e}");
            NodeExecutionResult::running(node_id, &node_hier, &node_type).failed(e.to_string())
        }
        Err(e) => {
            context.leave_node();
            return Err(e);
        }
    };
    let result = result.with_input(input_value.clone());

    // Input and result stay in the run dir for replay; only the outcome is committed.
    let records = &definition.record_settings;
    if let (Some(settings), Some(input)) = (records.for_type(RecordType::Input), &input_value) {
        context.record(input, RecordType::Input, settings, None).await;
    }
    if let Some(settings) = records.for_type(RecordType::Output) {
        let full = serde_json::to_value(&result)?;
        context.record(&full, RecordType::Output, settings, None).await;
    }
    if let Some(settings) = records.for_type(RecordType::Outcome) {
        let git = definition.git_settings.as_ref();
        context.record(&result.outcome, RecordType::Outcome, settings, git).await;
    }

    run.events()
        .publish(Event::notify(
            EventType::NodeExecutionComplete,
            node_id,
            &node_hier,
            serde_json::json!({
                "node_type": node_type,
                "status": result.execution_status,
            }),
        ))
        .await;
    context.leave_node();

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_are_tagged_by_node_type() {
        let definition: NodeDefinition = serde_json::from_value(json!({
            "settings": {"node_type": "command", "commands": ["echo hi"]},
            "fail_fast": true
        }))
        .unwrap();
        assert_eq!(definition.node_type(), "command");
        assert!(definition.fail_fast);
        assert!(definition.record_settings.result.is_some());
        assert!(definition.record_settings.input.is_none());

        let custom = NodeDefinition::custom("summarize", json!({"words": 10}));
        assert_eq!(custom.node_type(), "summarize");
    }

    #[test]
    fn test_validate_reports_two_default_resources() {
        let definition = NodeDefinition::custom("noop", NodeValue::Null)
            .with_resource(ResourceQuery::model("a").as_default())
            .with_resource(ResourceQuery::model("b").as_default());
        let problems = definition.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("is_default"));
    }

    #[test]
    fn test_requires_input_is_idempotent() {
        let definition = NodeDefinition::custom("noop", NodeValue::Null)
            .requires_input()
            .requires_input();
        assert_eq!(definition.pre_events, vec![EventType::NodeInputRequired]);
        assert!(definition.needs_input());
    }

    #[test]
    fn test_default_registry_covers_builtin_types() {
        let registry = ExecutorRegistry::with_defaults();
        for node_type in BUILTIN_NODE_TYPES {
            assert!(registry.contains(node_type), "{node_type} missing");
        }
        assert!(registry.get("custom").is_none());
    }

    #[test]
    fn test_custom_executor_may_not_shadow_builtin_type() {
        let shadowing = NodeDefinition::custom("command", json!({"commands": ["ls"]}));
        let problems = shadowing.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("shadows a built-in node type"));

        assert!(NodeDefinition::custom("summarize", NodeValue::Null).validate().is_empty());
    }

    #[test]
    fn test_file_operation_settings_deserialize() {
        let definition: NodeDefinition = serde_json::from_value(json!({
            "settings": {
                "node_type": "file_operation",
                "base_directory": "$var{run_dir}/workspace",
                "operations": [
                    {"type": "create_file", "path": "notes.md", "content": "# Notes"},
                    {"type": "modify_file", "path": "notes.md", "content": {
                        "start_point_match": "# ", "end_point_match": "s", "content": "Note"
                    }}
                ]
            }
        }))
        .unwrap();
        assert_eq!(definition.node_type(), "file_operation");
        assert!(definition.validate().is_empty());

        let empty = NodeDefinition::new(FileOperationSettings::new("."));
        assert_eq!(empty.validate(), vec!["file_operation node has no operations".to_string()]);
    }
}
