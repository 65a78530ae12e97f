use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::component::ComponentDefinition;
use crate::core::component::executor::execute_component;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::ResourceConfig;
use crate::core::result::NodeExecutionResult;

/// A node that runs an embedded component under its own hierarchy path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAgentSettings {
    pub flow: ComponentDefinition,
}

pub struct BasicAgentExecutor;

#[async_trait]
impl NodeExecutor for BasicAgentExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::BasicAgent(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "basic_agent executor received other settings".into(),
            });
        };
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "basic_agent");

        let mut child = context.create_child_context(node_id);
        let component = execute_component(&settings.flow, &mut child, settings.flow.kind.as_str()).await?;

        let summary: serde_json::Map<String, NodeValue> = component
            .ordered()
            .map(|(id, r)| (id.to_string(), r.outcome().clone()))
            .collect();
        let final_outcome = component
            .ordered()
            .last()
            .map(|(_, r)| r.outcome().clone())
            .unwrap_or(NodeValue::Null);
        let outcome = json!({
            "status": component.execution_status,
            "outcomes": summary,
            "final": final_outcome,
        });
        let status = component.execution_status;
        let error = component.error.clone();
        let output = serde_json::to_value(&component)?;

        let result = result.finish(status, output, outcome);
        Ok(match error {
            Some(e) if status.is_failure() => result.failed(e),
            _ => result,
        })
    }
}
