use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::NodeValue;

/// Lifecycle status shared by node and component results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_success(self) -> bool {
        self == ExecutionStatus::Completed
    }

    /// Failed, cancelled and timed-out results all count as unsuccessful terminations.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::Timeout
        )
    }
}

/// The recorded result of one node execution. Never mutated once stored in a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub node_identifier: String,
    pub node_hier: String,
    pub node_type: String,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub input: Option<NodeValue>,
    #[serde(default)]
    pub output: NodeValue,
    #[serde(default)]
    pub outcome: NodeValue,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeExecutionResult {
    /// Starts a result in the `Running` state.
    pub fn running(
        node_identifier: impl Into<String>,
        node_hier: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            node_identifier: node_identifier.into(),
            node_hier: node_hier.into(),
            node_type: node_type.into(),
            execution_status: ExecutionStatus::Running,
            input: None,
            output: NodeValue::Null,
            outcome: NodeValue::Null,
            error: None,
            errors: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_input(mut self, input: Option<NodeValue>) -> Self {
        self.input = input;
        self
    }

    /// Finishes the result with the given status, output and outcome.
    pub fn finish(mut self, status: ExecutionStatus, output: NodeValue, outcome: NodeValue) -> Self {
        self.execution_status = status;
        self.output = output;
        self.outcome = outcome;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn completed(self, output: NodeValue, outcome: NodeValue) -> Self {
        self.finish(ExecutionStatus::Completed, output, outcome)
    }

    /// Marks the result failed, keeping any output already attached.
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.errors.push(message.clone());
        self.error = Some(message);
        self.execution_status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_success(&self) -> bool {
        self.execution_status.is_success()
    }

    /// Value equality with timestamps ignored.
    pub fn same_as(&self, other: &NodeExecutionResult) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.created_at = b.created_at;
        a.completed_at = None;
        b.completed_at = None;
        a == b
    }
}

/// The recorded result of a component (flow, agent, conditional or loop).
///
/// `execution_results` holds exactly the elements executed or replayed in this
/// invocation; `execution_order` keeps their order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentExecutionResult {
    pub component_id: String,
    pub component_hier: String,
    pub component_type: String,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub execution_results: BTreeMap<String, ExecutionResult>,
    #[serde(default)]
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub outcome: NodeValue,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComponentExecutionResult {
    pub fn get(&self, id: &str) -> Option<&ExecutionResult> {
        self.execution_results.get(id)
    }

    /// Results in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = (&str, &ExecutionResult)> {
        self.execution_order
            .iter()
            .filter_map(|id| self.execution_results.get(id).map(|r| (id.as_str(), r)))
    }

    /// The first unsuccessful node reached depth-first, following failed sub-components
    /// down to the node that caused them.
    pub fn deepest_failure(&self) -> Option<&NodeExecutionResult> {
        self.ordered()
            .filter(|(_, result)| result.status().is_failure())
            .find_map(|(_, result)| match result {
                ExecutionResult::Node(node) => Some(node),
                ExecutionResult::Component(component) => component.deepest_failure(),
            })
    }

    /// Descends a slash-separated path of element ids.
    pub fn find(&self, path: &str) -> Option<&ExecutionResult> {
        let (head, rest) = match path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let found = self.execution_results.get(head)?;
        match rest {
            None => Some(found),
            Some(rest) => found.find(rest),
        }
    }
}

/// Either kind of recorded result, tagged by `result_type` when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result_type", rename_all = "snake_case")]
pub enum ExecutionResult {
    Node(NodeExecutionResult),
    Component(ComponentExecutionResult),
}

impl ExecutionResult {
    pub fn id(&self) -> &str {
        match self {
            ExecutionResult::Node(node) => &node.node_identifier,
            ExecutionResult::Component(component) => &component.component_id,
        }
    }

    pub fn hierarchy_path(&self) -> &str {
        match self {
            ExecutionResult::Node(node) => &node.node_hier,
            ExecutionResult::Component(component) => &component.component_hier,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionResult::Node(node) => node.execution_status,
            ExecutionResult::Component(component) => component.execution_status,
        }
    }

    pub fn outcome(&self) -> &NodeValue {
        match self {
            ExecutionResult::Node(node) => &node.outcome,
            ExecutionResult::Component(component) => &component.outcome,
        }
    }

    pub fn as_node(&self) -> Option<&NodeExecutionResult> {
        match self {
            ExecutionResult::Node(node) => Some(node),
            ExecutionResult::Component(_) => None,
        }
    }

    pub fn as_component(&self) -> Option<&ComponentExecutionResult> {
        match self {
            ExecutionResult::Component(component) => Some(component),
            ExecutionResult::Node(_) => None,
        }
    }

    pub fn find(&self, path: &str) -> Option<&ExecutionResult> {
        match self {
            ExecutionResult::Component(component) => component.find(path),
            ExecutionResult::Node(_) => None,
        }
    }

    /// The JSON form used by `$hier{}` lookups.
    pub fn to_value(&self) -> NodeValue {
        serde_json::to_value(self).unwrap_or(NodeValue::Null)
    }
}
