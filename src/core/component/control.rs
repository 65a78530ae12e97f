//! Control constructs: [`Conditional`] and [`ForEach`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::component::ComponentDefinition;
use crate::core::component::executor::execute_component;
use crate::core::context::{ExecutionContext, iteration_id};
use crate::core::error::FlowError;
use crate::core::recorder::{FileFormat, RecordSettings, RecordType};
use crate::core::result::{ComponentExecutionResult, ExecutionResult, ExecutionStatus};
use crate::core::template::Bindings;

/// Runs exactly one of two branches depending on a boolean statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    /// An expression, bare or wrapped in `$expr{}`.
    pub statement: String,
    pub then_branch: ComponentDefinition,
    #[serde(default)]
    pub else_branch: Option<ComponentDefinition>,
}

impl Conditional {
    pub fn new(statement: impl Into<String>, then_branch: ComponentDefinition) -> Self {
        Self {
            statement: statement.into(),
            then_branch,
            else_branch: None,
        }
    }

    pub fn otherwise(mut self, else_branch: ComponentDefinition) -> Self {
        self.else_branch = Some(else_branch);
        self
    }
}

/// Runs a body once per item of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEach {
    /// An expression yielding an array. `null` is treated as empty.
    pub statement: String,
    pub body: ComponentDefinition,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    /// Items beyond this bound are dropped with a warning. `None` is unbounded.
    /// `Some(0)` is a bound like any other: the loop runs no iterations and
    /// validation warns about it. Use `None`, not zero, to lift the bound.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default = "default_collect_results")]
    pub collect_results: bool,
    /// Record each iteration's outcome to `<loop>/iter_<i>/outcome.json`.
    #[serde(default)]
    pub record_iteration_outcome: bool,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

fn default_collect_results() -> bool {
    true
}

impl ForEach {
    pub fn new(statement: impl Into<String>, body: ComponentDefinition) -> Self {
        Self {
            statement: statement.into(),
            body,
            item_var: default_item_var(),
            index_var: default_index_var(),
            max_iterations: None,
            collect_results: default_collect_results(),
            record_iteration_outcome: false,
        }
    }

    pub fn item_var(mut self, name: impl Into<String>) -> Self {
        self.item_var = name.into();
        self
    }

    pub fn index_var(mut self, name: impl Into<String>) -> Self {
        self.index_var = name.into();
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn collect_results(mut self, collect: bool) -> Self {
        self.collect_results = collect;
        self
    }

    pub fn record_iteration_outcome(mut self, record: bool) -> Self {
        self.record_iteration_outcome = record;
        self
    }
}

/// Evaluates the statement and runs the matching branch in a conditional context.
///
/// A non-boolean statement runs neither branch and records nothing. Without an else
/// branch, a false statement still records an empty result.
pub(crate) async fn execute_conditional(
    id: &str,
    conditional: &Conditional,
    context: &mut ExecutionContext,
) -> Result<Option<ComponentExecutionResult>, FlowError> {
    let hier = context.child_hier(id);
    let value = context.evaluate_expression(&conditional.statement)?;
    let NodeValue::Bool(condition) = value else {
        log::warn!(
            "Conditional '{hier}' statement '{}' evaluated to {value}, not a boolean; skipping both branches",
            conditional.statement
        );
        return Ok(None);
    };

    let (label, branch) = if condition {
        ("then", Some(&conditional.then_branch))
    } else {
        ("else", conditional.else_branch.as_ref())
    };
    log::debug!("Conditional '{hier}' took the {label} branch");

    let bindings = Bindings::from([("condition".to_string(), NodeValue::Bool(condition))]);
    let mut child = context.create_conditional_context(id, bindings);
    let outcome = json!({
        "statement": conditional.statement,
        "condition": condition,
        "branch": branch.map(|_| label),
    });

    let Some(branch) = branch else {
        child.finalize();
        return Ok(Some(child.component_result("conditional", ExecutionStatus::Completed, outcome, None)));
    };

    let mut result = execute_component(branch, &mut child, label).await?;
    result.component_type = "conditional".to_string();
    if let NodeValue::Object(map) = &mut result.outcome {
        map.insert("branch".into(), json!(label));
    } else {
        let branch_outcome = std::mem::take(&mut result.outcome);
        result.outcome = json!({
            "statement": conditional.statement,
            "condition": condition,
            "branch": label,
            "result": branch_outcome,
        });
    }
    Ok(Some(result))
}

/// Runs the body once per item, in order, merging each iteration into `context`.
pub(crate) async fn execute_for_each(
    id: &str,
    for_each: &ForEach,
    context: &mut ExecutionContext,
) -> Result<ComponentExecutionResult, FlowError> {
    let hier = context.child_hier(id);
    let created_at = chrono::Utc::now();

    let items = match context.evaluate_expression(&for_each.statement)? {
        NodeValue::Array(items) => items,
        NodeValue::Null => Vec::new(),
        other => {
            return Err(FlowError::InvalidInput {
                node_id: hier,
                message: format!("for_each statement must yield a list, got {other}"),
            });
        }
    };

    let total_items = items.len();
    let limit = for_each.max_iterations.unwrap_or(total_items).min(total_items);
    let truncated = limit < total_items;
    if truncated {
        log::warn!("ForEach '{hier}' has {total_items} items; only the first {limit} will run");
    }

    let mut iterations = Vec::with_capacity(limit);
    let mut collected = Vec::with_capacity(limit);
    let mut status = ExecutionStatus::Completed;
    for (index, item) in items.into_iter().take(limit).enumerate() {
        let bindings = Bindings::from([
            (for_each.item_var.clone(), item),
            (for_each.index_var.clone(), json!(index)),
        ]);
        let mut child = context.create_iteration_context(id, index, bindings);
        let iteration = execute_component(&for_each.body, &mut child, "iteration").await?;
        if iteration.execution_status.is_failure() {
            status = ExecutionStatus::Failed;
        }

        let iteration_outcome = iteration.outcome.clone();
        if for_each.record_iteration_outcome {
            let iteration_hier = child.hierarchy_path().to_string();
            let settings = RecordSettings::in_node_dir("outcome.json", FileFormat::Json);
            child.record_at(&iteration_hier, &iteration_outcome, RecordType::Outcome, &settings).await;
        }
        if for_each.collect_results {
            collected.push(iteration_outcome);
        }
        context.merge_iteration_context(child)?;
        iterations.push((iteration_id(index), ExecutionResult::Component(iteration)));
    }

    let outcome = json!({
        "iterations": iterations.len(),
        "total_items": total_items,
        "truncated": truncated,
        "collected": for_each.collect_results.then_some(collected),
    });

    Ok(ComponentExecutionResult {
        component_id: id.to_string(),
        component_hier: hier,
        component_type: "for_each".to_string(),
        execution_status: status,
        execution_order: iterations.iter().map(|(key, _)| key.clone()).collect(),
        execution_results: iterations.into_iter().collect(),
        outcome,
        error: None,
        created_at,
        completed_at: Some(chrono::Utc::now()),
    })
}
