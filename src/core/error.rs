use thiserror::Error;

/// Failures raised while rendering `$var{}`, `$expr{}` and `$hier{}` placeholders.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Unresolved variable: {0}")]
    UnresolvedVariable(String),

    #[error("Unresolved expression: {0}")]
    UnresolvedExpression(String),

    #[error("Unresolved hierarchy reference: {0}")]
    UnresolvedHierarchy(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),
}

/// Crate-level error type.
///
/// Node execution failures (a non-zero exit code, a provider error) are *not* errors in
/// this sense: they are captured into the node's result. A `FlowError` means a run, or a
/// component within it, cannot continue.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input for node '{node_id}': {message}")]
    InvalidInput { node_id: String, message: String },

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Execution context '{0}' is finalized")]
    ContextFinalized(String),

    #[error("Rerun inconsistency: {0}")]
    RerunInconsistency(String),

    #[error("Node '{node_hier}' failed: {message}")]
    NodeFailed { node_hier: String, message: String },

    #[error("No executor registered for node type '{0}'")]
    ExecutorNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FlowError {
    /// The hierarchy path of the deepest failed node, if this error came from one.
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            FlowError::NodeFailed { node_hier, .. } => Some(node_hier),
            _ => None,
        }
    }
}
