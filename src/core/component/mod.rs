//! Component definitions: Flows and Agents.
//!
//! A component is an ordered list of [`Element`]s. Each element is a node, a nested
//! component, a [`Conditional`] or a [`ForEach`]. List position is the only ordering;
//! [`ComponentDefinition::order_of`] derives an index from it for display.
//!
//! Definitions are plain serde data. Whether built through [`FlowBuilder`] or loaded with
//! [`ComponentDefinition::from_json`] / [`ComponentDefinition::from_yaml`], they are
//! validated before they can run.

pub mod control;
pub mod executor;

use std::sync::{LazyLock, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeSettings};
use crate::core::validation::ValidationResult;

pub use control::{Conditional, ForEach};
pub use executor::execute_component;

static ELEMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex is valid"));

static ITERATION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^iter_\d+$").expect("static regex is valid"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    #[default]
    Flow,
    Agent,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Flow => "flow",
            ComponentKind::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    /// Accepted for forward compatibility; executes sequentially.
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element_type", rename_all = "snake_case")]
pub enum ElementKind {
    Node(NodeDefinition),
    Component(ComponentDefinition),
    Conditional(Conditional),
    ForEach(ForEach),
}

/// One entry of a component's element list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub element: ElementKind,
}

impl Element {
    pub fn new(id: impl Into<String>, element: ElementKind) -> Self {
        Self {
            id: id.into(),
            element,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.element {
            ElementKind::Node(_) => "node",
            ElementKind::Component(_) => "component",
            ElementKind::Conditional(_) => "conditional",
            ElementKind::ForEach(_) => "for_each",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    #[serde(default)]
    pub kind: ComponentKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    pub elements: Vec<Element>,
    /// Set once when the component becomes the top of a run.
    #[serde(skip)]
    root_id: OnceLock<String>,
}

impl ComponentDefinition {
    /// Starts building a Flow.
    pub fn flow() -> FlowBuilder {
        FlowBuilder::new(ComponentKind::Flow)
    }

    /// Starts building an Agent.
    pub fn agent() -> AgentBuilder {
        FlowBuilder::new(ComponentKind::Agent)
    }

    /// Parses and validates a JSON definition.
    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        let definition: Self = serde_json::from_str(text)?;
        definition.validate().into_result()?;
        Ok(definition)
    }

    /// Parses and validates a YAML definition.
    pub fn from_yaml(text: &str) -> Result<Self, FlowError> {
        let definition: Self = serde_yaml::from_str(text)?;
        definition.validate().into_result()?;
        Ok(definition)
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.get().map(String::as_str)
    }

    /// Fixes the root id. Setting the same id again is a no-op; a different one is an
    /// error.
    pub fn set_root_id(&self, root_id: &str) -> Result<(), FlowError> {
        if !ELEMENT_ID.is_match(root_id) {
            return Err(FlowError::Validation(format!("invalid root id '{root_id}'")));
        }
        let current = self.root_id.get_or_init(|| root_id.to_string());
        if current != root_id {
            return Err(FlowError::Validation(format!(
                "root id is already '{current}', cannot change it to '{root_id}'"
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Position of `id` in the element list.
    pub fn order_of(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Checks the whole tree. Never panics; all problems are collected.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        self.validate_into("", &mut result);
        result
    }

    fn validate_into(&self, prefix: &str, result: &mut ValidationResult) {
        let at = |id: &str| {
            if prefix.is_empty() {
                id.to_string()
            } else {
                format!("{prefix}/{id}")
            }
        };

        if self.elements.is_empty() {
            match self.kind {
                ComponentKind::Agent => result.add_error(format!("agent '{prefix}' has no elements")),
                ComponentKind::Flow => result.add_warning(format!("flow '{prefix}' has no elements")),
            }
        }
        if self.execution_strategy == ExecutionStrategy::Parallel {
            result.add_warning(format!(
                "component '{prefix}' requests parallel execution; elements run sequentially"
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for element in &self.elements {
            let path = at(&element.id);
            if !ELEMENT_ID.is_match(&element.id) {
                result.add_error(format!("invalid element id '{path}': use letters, digits, '_' or '-'"));
            }
            if !seen.insert(element.id.as_str()) {
                result.add_error(format!("duplicate element id '{path}'"));
            }

            match &element.element {
                ElementKind::Node(node) => {
                    for problem in node.validate() {
                        result.add_error(format!("node '{path}': {problem}"));
                    }
                    if let NodeSettings::BasicAgent(agent) = &node.settings {
                        agent.flow.validate_into(&path, result);
                    }
                }
                ElementKind::Component(component) => component.validate_into(&path, result),
                ElementKind::Conditional(conditional) => {
                    if conditional.statement.trim().is_empty() {
                        result.add_error(format!("conditional '{path}' has an empty statement"));
                    }
                    conditional.then_branch.validate_into(&path, result);
                    if let Some(else_branch) = &conditional.else_branch {
                        else_branch.validate_into(&path, result);
                    }
                }
                ElementKind::ForEach(for_each) => {
                    if for_each.statement.trim().is_empty() {
                        result.add_error(format!("for_each '{path}' has an empty statement"));
                    }
                    if for_each.max_iterations == Some(0) {
                        result.add_warning(format!("for_each '{path}' has max_iterations 0 and never runs"));
                    }
                    if for_each.item_var == for_each.index_var {
                        result.add_error(format!("for_each '{path}' uses the same name for item and index"));
                    }
                    for_each.body.validate_into(&format!("{path}/iter_N"), result);
                }
            }
        }
    }

    /// Whether `path` (relative to the root, or prefixed with `root_id`) names an element
    /// that this tree can produce. `iter_<n>` segments match any loop iteration.
    pub fn contains_hierarchy_path(&self, root_id: &str, path: &str) -> bool {
        let relative = path
            .strip_prefix(root_id)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(path);
        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        !segments.is_empty() && self.contains_segments(&segments)
    }

    fn contains_segments(&self, segments: &[&str]) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return true;
        };
        let Some(element) = self.get(head) else {
            return false;
        };
        if rest.is_empty() {
            return true;
        }
        match &element.element {
            ElementKind::Node(node) => match &node.settings {
                NodeSettings::BasicAgent(agent) => agent.flow.contains_segments(rest),
                _ => false,
            },
            ElementKind::Component(component) => component.contains_segments(rest),
            ElementKind::Conditional(conditional) => {
                conditional.then_branch.contains_segments(rest)
                    || conditional
                        .else_branch
                        .as_ref()
                        .is_some_and(|branch| branch.contains_segments(rest))
            }
            ElementKind::ForEach(for_each) => match rest.split_first() {
                Some((iteration, inner)) if ITERATION_SEGMENT.is_match(iteration) => {
                    for_each.body.contains_segments(inner)
                }
                _ => false,
            },
        }
    }
}

/// Builder for Flows and Agents. `build()` validates the result.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    definition: ComponentDefinition,
}

pub type AgentBuilder = FlowBuilder;

impl FlowBuilder {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            definition: ComponentDefinition {
                kind,
                ..ComponentDefinition::default()
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.definition.execution_strategy = strategy;
        self
    }

    pub fn element(mut self, element: Element) -> Self {
        self.definition.elements.push(element);
        self
    }

    pub fn node(self, id: impl Into<String>, definition: NodeDefinition) -> Self {
        self.element(Element::new(id, ElementKind::Node(definition)))
    }

    pub fn subflow(self, id: impl Into<String>, component: ComponentDefinition) -> Self {
        self.element(Element::new(id, ElementKind::Component(component)))
    }

    pub fn conditional(self, id: impl Into<String>, conditional: Conditional) -> Self {
        self.element(Element::new(id, ElementKind::Conditional(conditional)))
    }

    pub fn for_each(self, id: impl Into<String>, for_each: ForEach) -> Self {
        self.element(Element::new(id, ElementKind::ForEach(for_each)))
    }

    /// Validates and returns the definition.
    ///
    /// # Returns
    /// `FlowError::Validation` listing every error-level issue, if any.
    pub fn build(self) -> Result<ComponentDefinition, FlowError> {
        self.definition.validate().into_result()?;
        Ok(self.definition)
    }

    /// Returns the definition without validating. The runner still validates before
    /// executing.
    pub fn build_unchecked(self) -> ComponentDefinition {
        self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::CommandSettings;
    use serde_json::json;

    fn echo(text: &str) -> NodeDefinition {
        NodeDefinition::new(CommandSettings::new([format!("echo {text}")]))
    }

    #[test]
    fn test_duplicate_sibling_ids_fail() {
        let err = ComponentDefinition::flow()
            .node("a", echo("1"))
            .node("a", echo("2"))
            .build()
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(msg) if msg.contains("duplicate element id 'a'")));
    }

    #[test]
    fn test_same_id_in_different_scopes_is_fine() {
        let inner = ComponentDefinition::flow().node("a", echo("inner")).build().unwrap();
        let outer = ComponentDefinition::flow()
            .node("a", echo("outer"))
            .subflow("sub", inner)
            .build();
        assert!(outer.is_ok());
    }

    #[test]
    fn test_invalid_id_and_empty_agent() {
        let err = ComponentDefinition::flow().node("bad id", echo("x")).build().unwrap_err();
        assert!(err.to_string().contains("invalid element id"));
        assert!(ComponentDefinition::agent().build().is_err());
        assert!(ComponentDefinition::flow().build().is_ok());
    }

    #[test]
    fn test_root_id_is_set_once() {
        let flow = ComponentDefinition::flow().node("a", echo("1")).build().unwrap();
        flow.set_root_id("main").unwrap();
        flow.set_root_id("main").unwrap();
        assert!(flow.set_root_id("other").is_err());
        assert_eq!(flow.root_id(), Some("main"));
    }

    #[test]
    fn test_hierarchy_paths() {
        let body = ComponentDefinition::flow().node("step", echo("$var{item}")).build().unwrap();
        let then_branch = ComponentDefinition::flow().node("yes", echo("y")).build().unwrap();
        let flow = ComponentDefinition::flow()
            .node("first", echo("1"))
            .conditional("check", Conditional::new("true", then_branch))
            .for_each("loop", ForEach::new("$expr{items}", body))
            .build()
            .unwrap();

        assert!(flow.contains_hierarchy_path("root", "root/first"));
        assert!(flow.contains_hierarchy_path("root", "first"));
        assert!(flow.contains_hierarchy_path("root", "root/check/yes"));
        assert!(flow.contains_hierarchy_path("root", "root/loop/iter_3/step"));
        assert!(!flow.contains_hierarchy_path("root", "root/loop/step"));
        assert!(!flow.contains_hierarchy_path("root", "root/missing"));
        assert_eq!(flow.order_of("loop"), Some(2));
    }

    #[test]
    fn test_load_from_json_and_yaml() {
        let json_text = json!({
            "kind": "flow",
            "elements": [
                {"id": "list", "element": {"element_type": "node", "settings": {"node_type": "command", "commands": ["ls"]}}}
            ]
        })
        .to_string();
        let flow = ComponentDefinition::from_json(&json_text).unwrap();
        assert_eq!(flow.elements.len(), 1);

        let yaml_text = r#"
kind: flow
elements:
  - id: dup
    element: {element_type: node, settings: {node_type: command, commands: [ls]}}
  - id: dup
    element: {element_type: node, settings: {node_type: command, commands: [pwd]}}
"#;
        assert!(matches!(ComponentDefinition::from_yaml(yaml_text), Err(FlowError::Validation(_))));
    }
}
