use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;

use crate::core::NodeValue;
use crate::core::component::control::{execute_conditional, execute_for_each};
use crate::core::component::{ComponentDefinition, Element, ElementKind, ExecutionStrategy};
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::events::{Event, EventType};
use crate::core::node::run_node;
use crate::core::rerun::RerunDecision;
use crate::core::result::{ComponentExecutionResult, ExecutionResult, ExecutionStatus};

/// Walks `component`'s elements in order inside `context` and returns the component's
/// result. The context is finalized afterwards.
///
/// # Arguments
/// * `component` - The definition to execute
/// * `context` - A fresh context positioned at the component's hierarchy path
/// * `component_type` - Label stored in the result (`flow`, `agent`, `then`, ...)
///
/// # Returns
/// The component result, or the error of the first element that aborted the walk.
pub fn execute_component<'a>(
    component: &'a ComponentDefinition,
    context: &'a mut ExecutionContext,
    component_type: &'a str,
) -> BoxFuture<'a, Result<ComponentExecutionResult, FlowError>> {
    async move {
        let run = Arc::clone(context.run());
        let id = context.component_id().to_string();
        let hier = context.hierarchy_path().to_string();

        if component.execution_strategy == ExecutionStrategy::Parallel {
            log::warn!("Component '{hier}' requested parallel execution; running sequentially.");
        }
        run.events()
            .publish(Event::notify(
                EventType::ComponentExecutionStart,
                &id,
                &hier,
                json!({ "component_type": component_type, "elements": component.elements.len() }),
            ))
            .await;

        let mut aborted = None;
        for element in &component.elements {
            if let Err(e) = execute_element(element, context).await {
                log::error!("Component '{hier}' aborted at '{}': {e}", element.id);
                aborted = Some(e);
                break;
            }
        }

        let status = if aborted.is_some() {
            ExecutionStatus::Failed
        } else {
            context.derived_status()
        };
        let outcome = context
            .results()
            .last()
            .map(|(_, r)| r.outcome().clone())
            .unwrap_or(NodeValue::Null);
        let error = aborted.as_ref().map(ToString::to_string);
        context.finalize();
        let result = context.component_result(component_type, status, outcome, error);

        run.events()
            .publish(Event::notify(
                EventType::ComponentExecutionComplete,
                &id,
                &hier,
                json!({ "component_type": component_type, "status": status }),
            ))
            .await;

        match aborted {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
    .boxed()
}

/// Executes or replays one element and stores its result in `context`.
async fn execute_element(element: &Element, context: &mut ExecutionContext) -> Result<(), FlowError> {
    let run = Arc::clone(context.run());
    let hier = context.child_hier(&element.id);
    let decision = run.rerun().decide(&hier);

    let result = match &element.element {
        ElementKind::Node(definition) => {
            if decision == RerunDecision::Replay {
                let replayed = run.rerun().replay_node(&hier).await?;
                log::debug!("Replayed '{hier}' from the previous run");
                Some(ExecutionResult::Node(replayed))
            } else {
                let result = run_node(&element.id, definition, context).await?;
                if definition.fail_fast && result.execution_status.is_failure() {
                    let message = result.error.clone().unwrap_or_else(|| "node failed".to_string());
                    context.set_result(&element.id, ExecutionResult::Node(result))?;
                    return Err(FlowError::NodeFailed {
                        node_hier: hier,
                        message,
                    });
                }
                Some(ExecutionResult::Node(result))
            }
        }
        ElementKind::Component(component) => {
            let mut child = context.create_child_context(&element.id);
            let result = execute_component(component, &mut child, component.kind.as_str()).await?;
            Some(ExecutionResult::Component(result))
        }
        ElementKind::Conditional(conditional) => execute_conditional(&element.id, conditional, context)
            .await?
            .map(ExecutionResult::Component),
        ElementKind::ForEach(for_each) => {
            Some(ExecutionResult::Component(execute_for_each(&element.id, for_each, context).await?))
        }
    };

    if let Some(result) = result {
        context.set_result(&element.id, result)?;
    }
    Ok(())
}
