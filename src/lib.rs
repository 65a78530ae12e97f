//! # Tessera
//!
//! A composable flow and agent orchestration SDK. Declare a tree of typed nodes (model
//! calls, shell commands, file operations, folder analysis, callbacks), run it against
//! pluggable model providers, and get every input, result and outcome recorded to disk.
//!
//! ## Features
//!
//! - **Component Trees**: Flows and Agents built from nodes, sub-flows, conditionals and loops
//! - **Templates**: `$var{}`, `$expr{}` and `$hier{}` placeholders in any node setting
//! - **Recorded Runs**: Per-node `result.json`/`outcome.json` under a run directory, with optional git commits
//! - **Checkpoint Reruns**: Resume a previous run from any node, replaying everything before it
//! - **Optional LLM Integration**: An Ollama adapter behind the `llm` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tessera::prelude::*;
//!
//! # async fn demo() -> Result<(), FlowError> {
//! let flow = ComponentDefinition::flow()
//!     .node("hello", NodeDefinition::new(CommandSettings::new(["echo hello"])))
//!     .node("repeat", NodeDefinition::new(CommandSettings::new([
//!         "echo '$hier{hello}.outcome.results[0].stdout'",
//!     ])))
//!     .build()?;
//!
//! let config = RunConfig { root_dir: "/tmp/tessera".into(), ..RunConfig::default() };
//! let run = RunContextBuilder::new(config).build("main")?;
//! let result = Runner::new(flow, run)?.run().await?;
//! assert!(result.execution_status.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`prelude`]: Commonly used types and traits (import with `use tessera::prelude::*`)
//! - `llm`: Model provider adapters (feature `llm`)

// ============================================================================
// Core Module
// ============================================================================

mod core;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

pub use crate::core::NodeValue;

// Errors and validation
pub use crate::core::error::{FlowError, RenderError};
pub use crate::core::validation::{ValidationIssue, ValidationResult};

// Templates
pub use crate::core::expression::{is_truthy, lookup_path};
pub use crate::core::template::{Bindings, ResultLookup, TemplateEngine, TemplateScope, stringify};

// Execution state and results
pub use crate::core::context::{ContextState, ExecutionContext};
pub use crate::core::result::{ComponentExecutionResult, ExecutionResult, ExecutionStatus, NodeExecutionResult};

// Nodes
pub use crate::core::node::ai_model::{AIModelExecutor, AIModelNodeSettings, ModelCallConfig};
pub use crate::core::node::basic_agent::{BasicAgentExecutor, BasicAgentSettings};
pub use crate::core::node::callback::{
    AsyncFnCallback, Callback, CallbackArgs, CallbackError, CallbackExecutor, CallbackRegistry,
    CallbackSettings, FnCallback,
};
pub use crate::core::node::command::{CommandExecutor, CommandResult, CommandSettings};
pub use crate::core::node::file_operation::{
    FileModification, FileOperation, FileOperationExecutor, FileOperationSettings,
};
pub use crate::core::node::folder_analyzer::{
    FolderAnalyzerExecutor, FolderAnalyzerSettings, FolderOperation, OperationType,
};
pub use crate::core::node::git_repo_analyzer::{GitRepoAnalyzerExecutor, GitRepoAnalyzerSettings};
pub use crate::core::node::{
    BUILTIN_NODE_TYPES, CustomSettings, ExecutorRegistry, NodeDefinition, NodeExecutor, NodeInput, NodeSettings,
};

// Components
pub use crate::core::component::{
    AgentBuilder, ComponentDefinition, ComponentKind, Conditional, Element, ElementKind,
    ExecutionStrategy, FlowBuilder, ForEach, execute_component,
};

// Runs
pub use crate::core::rerun::{RerunDecision, RerunResolver};
pub use crate::core::run::{RunConfig, RunContext, RunContextBuilder, RunMetadata, generate_run_id};
pub use crate::core::runner::Runner;

// Collaborators
pub use crate::core::events::{
    Event, EventBus, EventHandler, EventNature, EventType, InputRequest, InputRequestReceiver,
};
pub use crate::core::git::{CommitEntry, GitCli, GitCollaborator, GitError, GitRepo};
pub use crate::core::recorder::{
    ArtifactRecorder, FileFormat, GitSettings, NodeRecordSettings, RecordSettings, RecordType,
};
pub use crate::core::resource::{
    ModelProvider, ModelRequest, ModelResponse, ProviderError, ResourceConfig, ResourceQuery,
    ResourceRegistry, ResourceResolver, ResourceType, validate_resources,
};

// ============================================================================
// Prelude Module - Convenient Bulk Imports
// ============================================================================

/// Everything needed to define and run flows.
///
/// # Example
/// ```rust
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        AIModelNodeSettings,
        CallbackRegistry,
        CallbackSettings,
        CommandSettings,
        ComponentDefinition,
        ComponentExecutionResult,
        Conditional,
        Event,
        EventBus,
        EventHandler,
        EventType,
        ExecutionContext,
        ExecutionResult,
        ExecutionStatus,
        FileFormat,
        FileOperation,
        FileOperationSettings,
        FlowError,
        FolderAnalyzerSettings,
        FolderOperation,
        ForEach,
        GitRepoAnalyzerSettings,
        GitSettings,
        InputRequest,
        ModelProvider,
        ModelRequest,
        ModelResponse,
        NodeDefinition,
        NodeExecutionResult,
        NodeExecutor,
        NodeInput,
        NodeRecordSettings,
        NodeValue,
        OperationType,
        ProviderError,
        RecordSettings,
        RenderError,
        ResourceConfig,
        ResourceQuery,
        ResourceRegistry,
        RunConfig,
        RunContextBuilder,
        Runner,
    };
}

// ============================================================================
// LLM Feature
// ============================================================================

#[cfg(feature = "llm")]
pub mod llm;

#[cfg(feature = "llm")]
pub use llm::{LLMError, OllamaConfig, OllamaProvider};

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use serde_json::Value as JsonValue;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
