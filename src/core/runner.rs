use std::sync::Arc;

use chrono::Utc;

use crate::core::component::{ComponentDefinition, execute_component};
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::events::EventBus;
use crate::core::result::{ComponentExecutionResult, ExecutionStatus};
use crate::core::run::RunContext;

/// Executes a root component against a prepared [`RunContext`].
pub struct Runner {
    component: ComponentDefinition,
    run: Arc<RunContext>,
}

impl Runner {
    /// Fixes the component's root id, validates it and, for reruns, checks that the start
    /// path names an element of the tree.
    ///
    /// # Returns
    /// `FlowError::Validation` for an invalid tree, `FlowError::RerunInconsistency` for a
    /// start path the tree cannot reach.
    pub fn new(component: ComponentDefinition, run: RunContext) -> Result<Self, FlowError> {
        component.set_root_id(&run.root_id)?;
        component.validate().into_result()?;

        if let Some(start) = run.rerun().start() {
            if run.rerun().is_rerun() && !component.contains_hierarchy_path(&run.root_id, start) {
                return Err(FlowError::RerunInconsistency(format!(
                    "start path '{start}' is not part of component '{}'",
                    run.root_id
                )));
            }
        }

        Ok(Self {
            component,
            run: Arc::new(run),
        })
    }

    pub fn run_context(&self) -> &Arc<RunContext> {
        &self.run
    }

    /// The run's event bus. Subscribe or open the input channel before calling
    /// [`run`](Self::run).
    pub fn events(&self) -> &Arc<EventBus> {
        self.run.events()
    }

    /// Runs the root component to completion and updates the run metadata.
    ///
    /// A failure leaves every artifact recorded so far on disk; the metadata names the
    /// failed node, if any, so the run can serve as a rerun checkpoint.
    pub async fn run(&self) -> Result<ComponentExecutionResult, FlowError> {
        let mut metadata = self.run.read_metadata()?;
        let mut context = ExecutionContext::root(Arc::clone(&self.run));
        let kind = self.component.kind.as_str();

        let mut outcome = execute_component(&self.component, &mut context, kind).await;
        if outcome.is_ok() && self.run.rerun().is_rerun() && !self.run.rerun().start_reached() {
            let start = self.run.rerun().start().unwrap_or_default().to_string();
            outcome = Err(FlowError::RerunInconsistency(format!(
                "start path '{start}' was never reached"
            )));
        }

        metadata.completed_at = Some(Utc::now());
        match &outcome {
            Ok(result) => {
                metadata.status = result.execution_status;
                if result.execution_status.is_failure() {
                    match result.deepest_failure() {
                        Some(node) => {
                            metadata.failed_node = Some(node.node_hier.clone());
                            metadata.error = node.error.clone();
                        }
                        None => metadata.error = result.error.clone(),
                    }
                }
                log::info!("Run '{}' finished: {:?}", self.run.run_id, result.execution_status);
            }
            Err(e) => {
                metadata.status = ExecutionStatus::Failed;
                metadata.failed_node = e.failed_node().map(str::to_string);
                metadata.error = Some(e.to_string());
                log::error!("Run '{}' failed: {e}", self.run.run_id);
            }
        }
        if let Err(e) = self.run.write_metadata(&metadata).await {
            log::error!("Could not update metadata for run '{}': {e}", self.run.run_id);
        }
        outcome
    }
}
