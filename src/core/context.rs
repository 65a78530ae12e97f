//! Per-component execution state.
//!
//! An [`ExecutionContext`] owns the results recorded by the component it belongs to.
//! Child contexts (sub-flows, conditional branches, loop iterations) get a frozen
//! snapshot of their ancestors, so lookups walk outwards without borrowing the parent.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::NodeValue;
use crate::core::error::{FlowError, RenderError};
use crate::core::expression::lookup_path;
use crate::core::recorder::{GitSettings, RecordSettings, RecordType};
use crate::core::result::{ComponentExecutionResult, ExecutionResult, ExecutionStatus};
use crate::core::run::RunContext;
use crate::core::template::{Bindings, ResultLookup, TemplateEngine, TemplateScope};

/// Reference that resolves to the most recent sibling result.
pub const PREVIOUS: &str = "previous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Active,
    Finalized,
}

/// The lookup-visible part of a context. Maps are shared until written.
#[derive(Debug, Clone, Default)]
struct Frame {
    component_id: String,
    hier_path: String,
    bindings: Arc<Bindings>,
    results: Arc<Vec<(String, ExecutionResult)>>,
    /// Results folded in from iteration contexts, keyed by their path relative to this
    /// frame (`loop/iter_0`).
    nested: Arc<Vec<(String, ExecutionResult)>>,
    parent: Option<Arc<Frame>>,
}

impl Frame {
    fn result(&self, id: &str) -> Option<&ExecutionResult> {
        self.results
            .iter()
            .rev()
            .find(|(key, _)| key == id)
            .map(|(_, result)| result)
    }

    fn lookup(&self, reference: &str) -> Option<&ExecutionResult> {
        let prefix = format!("{}/", self.hier_path);
        let relative = reference.strip_prefix(prefix.as_str()).unwrap_or(reference);

        let (head, rest) = match relative.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (relative, None),
        };
        if let Some(found) = self.result(head) {
            let hit = match rest {
                None => Some(found),
                Some(rest) => found.find(rest),
            };
            if hit.is_some() {
                return hit;
            }
        }

        for (key, result) in self.nested.iter().rev() {
            if relative == key {
                return Some(result);
            }
            if let Some(rest) = relative
                .strip_prefix(key.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                if let Some(found) = result.find(rest) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn ancestors(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(self), |frame| frame.parent.as_deref())
    }
}

/// Mutable state for one component invocation.
pub struct ExecutionContext {
    frame: Frame,
    run: Arc<RunContext>,
    state: ContextState,
    current_node: Option<String>,
    node_variables: Bindings,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// The context of the top-level component of a run.
    pub fn root(run: Arc<RunContext>) -> Self {
        let root_id = run.root_id.clone();
        Self {
            frame: Frame {
                component_id: root_id.clone(),
                hier_path: root_id,
                ..Frame::default()
            },
            run,
            state: ContextState::Active,
            current_node: None,
            node_variables: Bindings::new(),
            created_at: Utc::now(),
        }
    }

    fn child(&self, component_id: &str, hier_path: String, bindings: Bindings) -> Self {
        Self {
            frame: Frame {
                component_id: component_id.to_string(),
                hier_path,
                bindings: Arc::new(bindings),
                results: Arc::default(),
                nested: Arc::default(),
                parent: Some(Arc::new(self.frame.clone())),
            },
            run: Arc::clone(&self.run),
            state: ContextState::Active,
            current_node: None,
            node_variables: Bindings::new(),
            created_at: Utc::now(),
        }
    }

    /// Context for an embedded component (sub-flow, agent node).
    pub fn create_child_context(&self, element_id: &str) -> Self {
        self.child(element_id, self.child_hier(element_id), Bindings::new())
    }

    /// Context for the taken branch of a conditional.
    pub fn create_conditional_context(&self, element_id: &str, bindings: Bindings) -> Self {
        self.child(element_id, self.child_hier(element_id), bindings)
    }

    /// Context for iteration `index` of loop `loop_id`, seeded with the loop variables.
    pub fn create_iteration_context(&self, loop_id: &str, index: usize, bindings: Bindings) -> Self {
        let iteration_id = iteration_id(index);
        let hier = format!("{}/{}", self.child_hier(loop_id), iteration_id);
        self.child(&iteration_id, hier, bindings)
    }

    /// Folds a finished iteration context back into this one. Its results become
    /// addressable as `<loop>/iter_<i>/<node>`.
    pub fn merge_iteration_context(&mut self, mut child: ExecutionContext) -> Result<(), FlowError> {
        self.ensure_active()?;
        child.finalize();
        let prefix = format!("{}/", self.frame.hier_path);
        let key = child
            .frame
            .hier_path
            .strip_prefix(prefix.as_str())
            .unwrap_or(&child.frame.hier_path)
            .to_string();
        let status = child.derived_status();
        let result = child.component_result("iteration", status, NodeValue::Null, None);
        Arc::make_mut(&mut self.frame.nested).push((key, ExecutionResult::Component(result)));
        Ok(())
    }

    pub fn run(&self) -> &Arc<RunContext> {
        &self.run
    }

    pub fn component_id(&self) -> &str {
        &self.frame.component_id
    }

    pub fn hierarchy_path(&self) -> &str {
        &self.frame.hier_path
    }

    pub fn child_hier(&self, id: &str) -> String {
        format!("{}/{}", self.frame.hier_path, id)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Marks `node_id` as executing and exposes its input variables to templates.
    pub fn enter_node(&mut self, node_id: &str, variables: Option<&Bindings>) {
        self.current_node = Some(node_id.to_string());
        self.node_variables = variables.cloned().unwrap_or_default();
    }

    pub fn leave_node(&mut self) {
        self.current_node = None;
        self.node_variables.clear();
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    /// Hierarchy path of the executing node, or of the component itself.
    pub fn current_hier(&self) -> String {
        match &self.current_node {
            Some(node) => self.child_hier(node),
            None => self.frame.hier_path.clone(),
        }
    }

    pub fn set_result(&mut self, id: &str, result: ExecutionResult) -> Result<(), FlowError> {
        self.ensure_active()?;
        let results = Arc::make_mut(&mut self.frame.results);
        match results.iter_mut().find(|(key, _)| key == id) {
            Some(slot) => slot.1 = result,
            None => results.push((id.to_string(), result)),
        }
        Ok(())
    }

    pub fn result(&self, id: &str) -> Option<&ExecutionResult> {
        self.frame.result(id)
    }

    /// Results recorded directly in this context, in execution order.
    pub fn results(&self) -> impl Iterator<Item = (&str, &ExecutionResult)> {
        self.frame.results.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn finalize(&mut self) {
        self.state = ContextState::Finalized;
        self.current_node = None;
    }

    fn ensure_active(&self) -> Result<(), FlowError> {
        match self.state {
            ContextState::Active => Ok(()),
            ContextState::Finalized => Err(FlowError::ContextFinalized(self.frame.hier_path.clone())),
        }
    }

    /// Failed when any direct child failed, completed otherwise.
    pub fn derived_status(&self) -> ExecutionStatus {
        if self.frame.results.iter().any(|(_, r)| r.status().is_failure()) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }

    /// Builds the component result from the results recorded so far.
    pub fn component_result(
        &self,
        component_type: &str,
        status: ExecutionStatus,
        outcome: NodeValue,
        error: Option<String>,
    ) -> ComponentExecutionResult {
        ComponentExecutionResult {
            component_id: self.frame.component_id.clone(),
            component_hier: self.frame.hier_path.clone(),
            component_type: component_type.to_string(),
            execution_status: status,
            execution_results: self.frame.results.iter().cloned().collect(),
            execution_order: self.frame.results.iter().map(|(id, _)| id.clone()).collect(),
            outcome,
            error,
            created_at: self.created_at,
            completed_at: Some(Utc::now()),
        }
    }

    /// Variables visible to templates: run variables, bindings from the outermost
    /// context inwards, node input variables, then `node_id`/`node_hier`.
    pub fn template_variables(&self) -> Bindings {
        let mut variables = self.run.static_variables();
        let frames: Vec<&Frame> = self.frame.ancestors().collect();
        for frame in frames.into_iter().rev() {
            variables.extend(frame.bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        variables.extend(self.node_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(node) = &self.current_node {
            variables.insert("node_id".into(), NodeValue::String(node.clone()));
        }
        variables.insert("node_hier".into(), NodeValue::String(self.current_hier()));
        variables
    }

    pub fn with_scope<R>(&self, f: impl FnOnce(&TemplateScope<'_>) -> R) -> R {
        let variables = self.template_variables();
        let scope = TemplateScope::new(&variables).with_results(self);
        f(&scope)
    }

    pub fn render(&self, template: &str) -> Result<NodeValue, RenderError> {
        self.with_scope(|scope| TemplateEngine::render(template, scope))
    }

    pub fn render_string(&self, template: &str) -> Result<String, RenderError> {
        self.with_scope(|scope| TemplateEngine::render_string(template, scope))
    }

    pub fn render_value(&self, value: &NodeValue) -> Result<NodeValue, RenderError> {
        self.with_scope(|scope| TemplateEngine::render_value(value, scope))
    }

    pub fn evaluate_expression(&self, expression: &str) -> Result<NodeValue, RenderError> {
        self.with_scope(|scope| TemplateEngine::evaluate(expression, scope))
    }

    /// Dotted lookup across bindings, recorded results and run variables.
    pub fn get_value(&self, path: &str) -> Result<NodeValue, FlowError> {
        let (head, tail) = match path.find(['.', '[']) {
            Some(split) => path.split_at(split),
            None => (path, ""),
        };
        let tail = tail.trim_start_matches('.');

        let root = self
            .frame
            .ancestors()
            .find_map(|frame| frame.bindings.get(head).cloned())
            .or_else(|| self.node_variables.get(head).cloned())
            .or_else(|| self.hierarchy_value(head))
            .or_else(|| self.run.static_variables().remove(head));

        root.and_then(|root| lookup_path(&root, tail))
            .ok_or_else(|| FlowError::KeyNotFound(path.to_string()))
    }

    /// Writes one record for the executing node through the run's recorder.
    pub async fn record(
        &self,
        data: &NodeValue,
        record_type: RecordType,
        settings: &RecordSettings,
        git_settings: Option<&GitSettings>,
    ) -> bool {
        let variables = self.template_variables();
        let scope = TemplateScope::new(&variables).with_results(self);
        let node = self.current_node.as_deref().unwrap_or(&self.frame.component_id);
        self.run
            .recorder()
            .record(node, data, record_type, settings, git_settings, &scope)
            .await
    }

    /// Like [`record`](Self::record) but for an explicit hierarchy path, used for loop
    /// iteration outcomes.
    pub async fn record_at(
        &self,
        hier: &str,
        data: &NodeValue,
        record_type: RecordType,
        settings: &RecordSettings,
    ) -> bool {
        let mut variables = self.template_variables();
        variables.insert("node_hier".into(), NodeValue::String(hier.to_string()));
        let scope = TemplateScope::new(&variables).with_results(self);
        self.run
            .recorder()
            .record(hier, data, record_type, settings, None, &scope)
            .await
    }
}

impl ResultLookup for ExecutionContext {
    fn hierarchy_value(&self, reference: &str) -> Option<NodeValue> {
        if reference == PREVIOUS {
            return self
                .frame
                .ancestors()
                .find_map(|frame| frame.results.last())
                .map(|(_, result)| result.to_value());
        }
        self.frame
            .ancestors()
            .find_map(|frame| frame.lookup(reference))
            .map(ExecutionResult::to_value)
    }
}

pub fn iteration_id(index: usize) -> String {
    format!("iter_{index}")
}
