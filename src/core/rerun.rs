//! Rerun from a checkpoint.
//!
//! A rerun links to a previous run directory and names a start hierarchy path. Elements
//! reached before the start are replayed from the previous run's `result.json`; the start
//! element and everything after it execute normally. Replaying copies the previous
//! artifacts into the new run directory so the new run is a complete checkpoint itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::FlowError;
use crate::core::result::NodeExecutionResult;

const RESULT_FILE: &str = "result.json";
const OUTCOME_FILE: &str = "outcome.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunDecision {
    /// Run the element's executor.
    Execute,
    /// Load the element's previous result instead of running it.
    Replay,
    /// The start lies inside this element: enter it and decide again per child.
    Descend,
}

#[derive(Debug)]
pub struct RerunResolver {
    previous_run_dir: Option<PathBuf>,
    run_dir: PathBuf,
    start: Option<String>,
    reached: AtomicBool,
}

impl RerunResolver {
    /// A resolver for a fresh run: everything executes.
    pub fn fresh(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            previous_run_dir: None,
            run_dir: run_dir.into(),
            start: None,
            reached: AtomicBool::new(true),
        }
    }

    /// # Arguments
    /// * `previous_run_dir` - Directory of the run being resumed
    /// * `run_dir` - Directory of the new run
    /// * `start` - Full hierarchy path (`root/...`) of the first element to execute
    pub fn new(previous_run_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>, start: Option<String>) -> Self {
        let reached = start.is_none();
        Self {
            previous_run_dir: Some(previous_run_dir.into()),
            run_dir: run_dir.into(),
            start,
            reached: AtomicBool::new(reached),
        }
    }

    pub fn is_rerun(&self) -> bool {
        self.previous_run_dir.is_some()
    }

    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    pub fn start_reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    /// Decides what to do with the element at `hier`. Must be called in traversal order.
    pub fn decide(&self, hier: &str) -> RerunDecision {
        let Some(start) = self.start.as_deref() else {
            return RerunDecision::Execute;
        };
        if self.previous_run_dir.is_none() || self.start_reached() {
            return RerunDecision::Execute;
        }
        if hier == start {
            log::info!("Rerun reached start element '{start}'");
            self.reached.store(true, Ordering::SeqCst);
            return RerunDecision::Execute;
        }
        if start.starts_with(&format!("{hier}/")) {
            return RerunDecision::Descend;
        }
        RerunDecision::Replay
    }

    /// Loads the previous result of the node at `hier` and copies its artifacts into the
    /// new run directory.
    pub async fn replay_node(&self, hier: &str) -> Result<NodeExecutionResult, FlowError> {
        let Some(previous) = &self.previous_run_dir else {
            return Err(FlowError::RerunInconsistency(format!(
                "cannot replay '{hier}' without a previous run"
            )));
        };
        let source_dir = previous.join(hier);
        let text = tokio::fs::read_to_string(source_dir.join(RESULT_FILE))
            .await
            .map_err(|e| {
                FlowError::RerunInconsistency(format!(
                    "previous run has no result for '{hier}' ({}): {e}",
                    source_dir.display()
                ))
            })?;
        let result: NodeExecutionResult = serde_json::from_str(&text).map_err(|e| {
            FlowError::RerunInconsistency(format!("recorded result for '{hier}' is unreadable: {e}"))
        })?;

        let target_dir = self.run_dir.join(hier);
        copy_artifacts(&source_dir, &target_dir).await;
        Ok(result)
    }
}

async fn copy_artifacts(source_dir: &Path, target_dir: &Path) {
    if let Err(e) = tokio::fs::create_dir_all(target_dir).await {
        log::error!("Could not create {}: {e}", target_dir.display());
        return;
    }
    for file in [RESULT_FILE, OUTCOME_FILE] {
        let source = source_dir.join(file);
        if !source.is_file() {
            continue;
        }
        if let Err(e) = tokio::fs::copy(&source, target_dir.join(file)).await {
            log::error!("Could not copy {} into the rerun: {e}", source.display());
        }
    }
}
