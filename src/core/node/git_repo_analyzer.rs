use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::git::GitRepo;
use crate::core::node::folder_analyzer::{FolderOperation, OperationType, resolve_base, run_operations, summarize};
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::ResourceConfig;
use crate::core::result::{ExecutionStatus, NodeExecutionResult};

/// Folder analysis of a git work tree plus its history and branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRepoAnalyzerSettings {
    /// Template. Relative paths resolve against the run directory.
    pub repo_directory: String,
    /// Folder operations over the work tree. Defaults to one `analyze_folder` of the root.
    #[serde(default)]
    pub operations: Vec<FolderOperation>,
    #[serde(default = "default_true")]
    pub include_history: bool,
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
    #[serde(default = "default_true")]
    pub include_branches: bool,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_commits() -> usize {
    20
}

impl GitRepoAnalyzerSettings {
    pub fn new(repo_directory: impl Into<String>) -> Self {
        Self {
            repo_directory: repo_directory.into(),
            operations: Vec::new(),
            include_history: true,
            max_commits: default_max_commits(),
            include_branches: true,
            respect_gitignore: true,
        }
    }

    pub fn max_commits(mut self, max_commits: usize) -> Self {
        self.max_commits = max_commits;
        self
    }
}

pub struct GitRepoAnalyzerExecutor;

#[async_trait]
impl NodeExecutor for GitRepoAnalyzerExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::GitRepoAnalyzer(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "git_repo_analyzer executor received other settings".into(),
            });
        };
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "git_repo_analyzer");

        let root = resolve_base(context, &settings.repo_directory)?;
        let repo = GitRepo::new(&root);
        if !root.is_dir() {
            return Ok(result.failed(format!("repository directory {} does not exist", root.display())));
        }
        if !repo.is_repository() {
            return Ok(result.failed(format!("{} is not a git repository", root.display())));
        }

        let mut operations = if settings.operations.is_empty() {
            vec![FolderOperation::new(OperationType::AnalyzeFolder, ".")]
        } else {
            settings.operations.clone()
        };
        for op in &mut operations {
            op.path = context.render_string(&op.path)?;
            if !op.exclude_patterns.iter().any(|p| p == ".git") {
                op.exclude_patterns.push(".git".to_string());
            }
        }

        let base = root.clone();
        let respect_gitignore = settings.respect_gitignore;
        let (results, stats) = tokio::task::spawn_blocking(move || {
            run_operations(&base, &operations, respect_gitignore, false)
        })
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))?;
        let (mut output, mut outcome, errors) = summarize(&settings.repo_directory, results, &stats);

        let mut git = serde_json::Map::new();
        if settings.include_history {
            match repo.log(None, Some(settings.max_commits), true).await {
                Ok(commits) => {
                    git.insert("git_history".into(), serde_json::to_value(&commits)?);
                }
                Err(e) => {
                    log::warn!("Could not read git history of {}: {e}", root.display());
                    git.insert("git_history_error".into(), json!(e.to_string()));
                }
            }
        }
        if settings.include_branches {
            match branch_summary(&repo).await {
                Ok(summary) => git.extend(summary),
                Err(e) => {
                    log::warn!("Could not read git branches of {}: {e}", root.display());
                    git.insert("git_branch_error".into(), json!(e.to_string()));
                }
            }
        }
        for target in [&mut output, &mut outcome] {
            if let NodeValue::Object(map) = target {
                map.extend(git.clone());
            }
        }

        if errors.is_empty() {
            return Ok(result.finish(ExecutionStatus::Completed, output, outcome));
        }
        let mut result = result.finish(ExecutionStatus::Failed, output, outcome);
        result.errors = errors;
        Ok(result.failed("one or more folder operations failed"))
    }
}

async fn branch_summary(repo: &GitRepo) -> Result<serde_json::Map<String, NodeValue>, crate::core::git::GitError> {
    let branches = repo.list_branches().await?;
    let current = repo.current_branch().await?;
    let mut heads = serde_json::Map::new();
    for branch in &branches {
        if let Some(head) = repo.log(Some(branch), Some(1), true).await?.into_iter().next() {
            heads.insert(branch.clone(), serde_json::to_value(head).unwrap_or(NodeValue::Null));
        }
    }
    let mut summary = serde_json::Map::new();
    summary.insert("current_branch".into(), json!(current));
    summary.insert("branches".into(), json!(branches));
    summary.insert("branch_heads".into(), NodeValue::Object(heads));
    Ok(summary)
}
