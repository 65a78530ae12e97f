//! Run environment: identifiers, directories, registries and the event bus shared by
//! every context of one run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::NodeValue;
use crate::core::error::FlowError;
use crate::core::events::EventBus;
use crate::core::git::{GitCli, GitCollaborator};
use crate::core::node::{CallbackRegistry, ExecutorRegistry, NodeExecutor, NodeInput};
use crate::core::recorder::ArtifactRecorder;
use crate::core::rerun::RerunResolver;
use crate::core::resource::{ResourceRegistry, ResourceResolver};
use crate::core::result::ExecutionStatus;
use crate::core::template::Bindings;

const RUNS_DIR: &str = "runs";
const OUTCOME_DIR: &str = "outcome";
const TRACE_DIR: &str = ".trace";
const STATIC_INPUTS_DIR: &str = "static_inputs";
const METADATA_FILE: &str = "dad_metadata.json";

/// User-facing configuration of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub root_dir: PathBuf,
    pub project_name: String,
    pub run_id_prefix: Option<String>,
    /// Resume from this run. Requires `start_hierarchy_path` to replay anything.
    pub previous_run_id: Option<String>,
    pub start_hierarchy_path: Option<String>,
    pub static_variables: Bindings,
    /// Inputs keyed by node id or hierarchy path.
    pub static_inputs: HashMap<String, NodeInput>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            project_name: "project".to_string(),
            run_id_prefix: None,
            previous_run_id: None,
            start_hierarchy_path: None,
            static_variables: Bindings::new(),
            static_inputs: HashMap::new(),
        }
    }
}

/// Contents of `.trace/dad_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub root_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub previous_run_id: Option<String>,
    pub start_hierarchy_path: Option<String>,
    #[serde(default)]
    pub failed_node: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Read-only state shared by every context of one run.
pub struct RunContext {
    pub run_id: String,
    pub root_id: String,
    pub project_name: String,
    pub run_root: PathBuf,
    pub run_dir: PathBuf,
    pub trace_dir: PathBuf,
    pub static_inputs_dir: PathBuf,
    pub outcome_repo_dir: PathBuf,
    pub previous_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    static_variables: Bindings,
    static_inputs: HashMap<String, NodeInput>,
    executors: ExecutorRegistry,
    callbacks: CallbackRegistry,
    resources: Arc<dyn ResourceResolver>,
    events: Arc<EventBus>,
    recorder: ArtifactRecorder,
    rerun: RerunResolver,
}

impl RunContext {
    pub fn builder(config: RunConfig) -> RunContextBuilder {
        RunContextBuilder::new(config)
    }

    /// Variables every template can read: run paths plus the configured static ones.
    pub fn static_variables(&self) -> Bindings {
        let mut variables = self.static_variables.clone();
        let path = |p: &Path| NodeValue::String(p.to_string_lossy().into_owned());
        variables.insert("run_id".into(), NodeValue::String(self.run_id.clone()));
        variables.insert("run_dir".into(), path(&self.run_dir));
        variables.insert("run_root".into(), path(&self.run_root));
        variables.insert("trace_dir".into(), path(&self.trace_dir));
        variables.insert("outcome_repo_dir".into(), path(&self.outcome_repo_dir));
        variables
    }

    /// The static input for a node, looked up by hierarchy path first, then by id.
    pub fn static_input(&self, node_id: &str, node_hier: &str) -> Option<NodeInput> {
        self.static_inputs
            .get(node_hier)
            .or_else(|| self.static_inputs.get(node_id))
            .cloned()
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn resources(&self) -> &dyn ResourceResolver {
        self.resources.as_ref()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn recorder(&self) -> &ArtifactRecorder {
        &self.recorder
    }

    pub fn rerun(&self) -> &RerunResolver {
        &self.rerun
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.trace_dir.join(METADATA_FILE)
    }

    pub fn read_metadata(&self) -> Result<RunMetadata, FlowError> {
        let text = fs::read_to_string(self.metadata_path())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub(crate) async fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), FlowError> {
        let text = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(self.metadata_path(), text).await?;
        Ok(())
    }
}

/// Builds a [`RunContext`], creating the run's directories.
pub struct RunContextBuilder {
    config: RunConfig,
    executors: ExecutorRegistry,
    callbacks: CallbackRegistry,
    resources: Option<Arc<dyn ResourceResolver>>,
    events: Arc<EventBus>,
    git: Arc<dyn GitCollaborator>,
}

impl RunContextBuilder {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            executors: ExecutorRegistry::with_defaults(),
            callbacks: CallbackRegistry::new(),
            resources: None,
            events: Arc::new(EventBus::new()),
            git: Arc::new(GitCli),
        }
    }

    /// Registers an executor, typically for a `custom` node type.
    pub fn with_executor(mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.register(node_type, executor);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceResolver>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Shares an existing bus, so subscriptions made before the run starts are kept.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_git(mut self, git: Arc<dyn GitCollaborator>) -> Self {
        self.git = git;
        self
    }

    /// Creates the run directories and writes the initial metadata.
    ///
    /// # Arguments
    /// * `root_id` - Id of the top-level component; the first segment of every hierarchy path
    ///
    /// # Returns
    /// `FlowError::RerunInconsistency` if the configured previous run does not exist.
    pub fn build(self, root_id: &str) -> Result<RunContext, FlowError> {
        let config = self.config;
        let run_root = config.root_dir.join(RUNS_DIR);
        let is_rerun = config.previous_run_id.is_some();
        let run_id = generate_run_id(config.run_id_prefix.as_deref(), is_rerun);
        let run_dir = run_root.join(&run_id);
        let trace_dir = run_dir.join(TRACE_DIR);
        let static_inputs_dir = run_dir.join(STATIC_INPUTS_DIR);
        let outcome_repo_dir = run_root.join(OUTCOME_DIR).join(&config.project_name);

        let start = config
            .start_hierarchy_path
            .as_deref()
            .map(|path| normalize_hierarchy_path(root_id, path));
        let rerun = match &config.previous_run_id {
            Some(previous) => {
                let previous_dir = run_root.join(previous);
                if !previous_dir.is_dir() {
                    return Err(FlowError::RerunInconsistency(format!(
                        "previous run '{previous}' not found at {}",
                        previous_dir.display()
                    )));
                }
                RerunResolver::new(previous_dir, &run_dir, start.clone())
            }
            None => {
                if start.is_some() {
                    log::warn!("start_hierarchy_path is ignored without previous_run_id");
                }
                RerunResolver::fresh(&run_dir)
            }
        };

        fs::create_dir_all(&trace_dir)?;
        fs::create_dir_all(&static_inputs_dir)?;
        fs::create_dir_all(&outcome_repo_dir)?;
        for (key, input) in &config.static_inputs {
            let file = static_inputs_dir.join(format!("{}.json", key.replace('/', "__")));
            fs::write(file, serde_json::to_vec_pretty(input)?)?;
        }

        let created_at = Utc::now();
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            root_id: root_id.to_string(),
            created_at,
            completed_at: None,
            status: ExecutionStatus::Running,
            previous_run_id: config.previous_run_id.clone(),
            start_hierarchy_path: start,
            failed_node: None,
            error: None,
        };
        fs::write(trace_dir.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)?;
        log::info!("Run '{run_id}' initialised at {}", run_dir.display());

        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(ResourceRegistry::new()));
        Ok(RunContext {
            recorder: ArtifactRecorder::new(&run_dir, &outcome_repo_dir, self.git),
            run_id,
            root_id: root_id.to_string(),
            project_name: config.project_name,
            run_root,
            run_dir,
            trace_dir,
            static_inputs_dir,
            outcome_repo_dir,
            previous_run_id: config.previous_run_id,
            created_at,
            static_variables: config.static_variables,
            static_inputs: config.static_inputs,
            executors: self.executors,
            callbacks: self.callbacks,
            resources,
            events: self.events,
            rerun,
        })
    }
}

/// `{prefix_}{run|rerun}_{YYYYmmdd_HHMMSS}_{6 hex}`.
pub fn generate_run_id(prefix: Option<&str>, is_rerun: bool) -> String {
    let kind = if is_rerun { "rerun" } else { "run" };
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}_{kind}_{stamp}_{suffix}"),
        None => format!("{kind}_{stamp}_{suffix}"),
    }
}

/// Prefixes `path` with `root_id` unless it already starts with it.
pub fn normalize_hierarchy_path(root_id: &str, path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed == root_id || trimmed.starts_with(&format!("{root_id}/")) {
        trimmed.to_string()
    } else {
        format!("{root_id}/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    #[test]
    fn test_run_id_format() {
        let pattern = Regex::new(r"^nightly_rerun_\d{8}_\d{6}_[0-9a-f]{6}$").unwrap();
        assert!(pattern.is_match(&generate_run_id(Some("nightly"), true)));
        let plain = Regex::new(r"^run_\d{8}_\d{6}_[0-9a-f]{6}$").unwrap();
        assert!(plain.is_match(&generate_run_id(None, false)));
    }

    #[test]
    fn test_normalize_hierarchy_path() {
        assert_eq!(normalize_hierarchy_path("root", "a/b"), "root/a/b");
        assert_eq!(normalize_hierarchy_path("root", "/root/a/"), "root/a");
        assert_eq!(normalize_hierarchy_path("root", "rooted"), "root/rooted");
    }

    #[test]
    fn test_build_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            root_dir: dir.path().to_path_buf(),
            project_name: "demo".into(),
            static_variables: Bindings::from([("team".to_string(), json!("core"))]),
            static_inputs: HashMap::from([("ask".to_string(), NodeInput::default().with_variable("q", json!(1)))]),
            ..RunConfig::default()
        };
        let run = RunContextBuilder::new(config).build("main").unwrap();

        assert!(run.trace_dir.is_dir());
        assert!(run.outcome_repo_dir.ends_with("runs/outcome/demo"));
        assert!(run.static_inputs_dir.join("ask.json").is_file());
        assert_eq!(run.read_metadata().unwrap().status, ExecutionStatus::Running);

        let vars = run.static_variables();
        assert_eq!(vars["team"], json!("core"));
        assert_eq!(vars["run_id"], json!(run.run_id.clone()));
        assert!(run.static_input("ask", "main/ask").is_some());
    }

    #[test]
    fn test_missing_previous_run_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            root_dir: dir.path().to_path_buf(),
            previous_run_id: Some("run_gone".into()),
            ..RunConfig::default()
        };
        assert!(matches!(
            RunContextBuilder::new(config).build("main"),
            Err(FlowError::RerunInconsistency(_))
        ));
    }
}
