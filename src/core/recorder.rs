use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::NodeValue;
use crate::core::error::FlowError;
use crate::core::git::GitCollaborator;
use crate::core::template::{TemplateEngine, TemplateScope};

/// Serialization used when writing a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Json,
    Yaml,
    Text,
    Binary,
}

/// What part of a node execution is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Input,
    /// The full node result.
    Output,
    Outcome,
}

/// Where and how one record is written. `path` and `filename` are templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub file_format: FileFormat,
}

fn enabled_by_default() -> bool {
    true
}

impl RecordSettings {
    pub fn new(path: impl Into<String>, filename: impl Into<String>, file_format: FileFormat) -> Self {
        Self {
            enabled: true,
            path: path.into(),
            filename: filename.into(),
            file_format,
        }
    }

    /// `<node_hier>/<filename>` in the given format.
    pub fn in_node_dir(filename: impl Into<String>, file_format: FileFormat) -> Self {
        Self::new("$var{node_hier}/", filename, file_format)
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-node record configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecordSettings {
    #[serde(default)]
    pub input: Option<RecordSettings>,
    #[serde(default = "default_result_settings")]
    pub result: Option<RecordSettings>,
    #[serde(default = "default_outcome_settings")]
    pub outcome: Option<RecordSettings>,
}

fn default_result_settings() -> Option<RecordSettings> {
    Some(RecordSettings::in_node_dir("result.json", FileFormat::Json))
}

fn default_outcome_settings() -> Option<RecordSettings> {
    Some(RecordSettings::in_node_dir("outcome.json", FileFormat::Json))
}

impl Default for NodeRecordSettings {
    fn default() -> Self {
        Self {
            input: None,
            result: default_result_settings(),
            outcome: default_outcome_settings(),
        }
    }
}

impl NodeRecordSettings {
    pub fn for_type(&self, record_type: RecordType) -> Option<&RecordSettings> {
        match record_type {
            RecordType::Input => self.input.as_ref(),
            RecordType::Output => self.result.as_ref(),
            RecordType::Outcome => self.outcome.as_ref(),
        }
    }
}

/// Commit configuration for recorded outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSettings {
    #[serde(default)]
    pub commit: bool,
    #[serde(default)]
    pub commit_message: Option<String>,
}

const DEFAULT_COMMIT_MESSAGE: &str = "$var{run_id}: record $var{node_hier}";

/// Writes node records below the run directory. Committed outcomes are mirrored into
/// the outcome repository and committed there.
#[derive(Clone)]
pub struct ArtifactRecorder {
    run_dir: PathBuf,
    outcome_repo_dir: PathBuf,
    git: Arc<dyn GitCollaborator>,
}

impl ArtifactRecorder {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        outcome_repo_dir: impl Into<PathBuf>,
        git: Arc<dyn GitCollaborator>,
    ) -> Self {
        Self {
            run_dir: run_dir.into(),
            outcome_repo_dir: outcome_repo_dir.into(),
            git,
        }
    }

    /// Records `data`. Failures are logged and reported as `false`, never raised.
    ///
    /// The run directory copy is always written, since reruns replay from it. Only
    /// [`RecordType::Outcome`] honours `git_settings`.
    pub async fn record(
        &self,
        node_identifier: &str,
        data: &NodeValue,
        record_type: RecordType,
        settings: &RecordSettings,
        git_settings: Option<&GitSettings>,
        scope: &TemplateScope<'_>,
    ) -> bool {
        if !settings.enabled {
            return false;
        }

        let relative_path = match record_path(settings, scope) {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to record {record_type:?} for '{node_identifier}': {e}");
                return false;
            }
        };
        let bytes = match serialize(data, settings.file_format) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to record {record_type:?} for '{node_identifier}': {e}");
                return false;
            }
        };
        let written = match write_under(&self.run_dir, &relative_path, &bytes).await {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to record {record_type:?} for '{node_identifier}': {e}");
                return false;
            }
        };
        log::debug!("Recorded {record_type:?} for '{node_identifier}' at {}", written.display());

        let commit = git_settings.filter(|g| g.commit && record_type == RecordType::Outcome);
        let Some(git) = commit else {
            return true;
        };

        let template = git.commit_message.as_deref().unwrap_or(DEFAULT_COMMIT_MESSAGE);
        let message = match TemplateEngine::render_string(template, scope) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to render commit message for '{node_identifier}': {e}");
                return false;
            }
        };
        let mirrored = match write_under(&self.outcome_repo_dir, &relative_path, &bytes).await {
            Ok(path) => path,
            Err(e) => {
                log::error!("Failed to copy outcome of '{node_identifier}' into the outcome repo: {e}");
                return false;
            }
        };
        match self
            .git
            .commit_files(&self.outcome_repo_dir, &[mirrored], &message)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                log::error!("Failed to commit record for '{node_identifier}': {e}");
                false
            }
        }
    }
}

/// The record's path relative to whichever base directory receives it.
fn record_path(settings: &RecordSettings, scope: &TemplateScope<'_>) -> Result<PathBuf, FlowError> {
    let dir = TemplateEngine::render_string(&settings.path, scope)?;
    let filename = TemplateEngine::render_string(&settings.filename, scope)?;
    if filename.trim().is_empty() {
        return Err(FlowError::Validation("record filename rendered empty".into()));
    }
    Ok(relative(&dir)?.join(relative(&filename)?))
}

async fn write_under(base: &Path, relative_path: &Path, bytes: &[u8]) -> Result<PathBuf, FlowError> {
    let target = base.join(relative_path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, bytes).await?;
    Ok(target)
}

/// Rejects absolute paths and parent traversal so paths stay under their base dir.
pub(crate) fn relative(rendered: &str) -> Result<PathBuf, FlowError> {
    let path = Path::new(rendered.trim_start_matches('/'));
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(FlowError::Validation(format!(
            "path '{rendered}' escapes its base directory"
        )));
    }
    Ok(path.to_path_buf())
}

fn serialize(data: &NodeValue, format: FileFormat) -> Result<Vec<u8>, FlowError> {
    match format {
        FileFormat::Json => Ok(serde_json::to_vec_pretty(data)?),
        FileFormat::Yaml => Ok(serde_yaml::to_string(data)?.into_bytes()),
        FileFormat::Text => match data {
            NodeValue::String(text) => Ok(text.clone().into_bytes()),
            other => Ok(serde_json::to_string_pretty(other)?.into_bytes()),
        },
        FileFormat::Binary => match data {
            NodeValue::String(text) => Ok(text.clone().into_bytes()),
            NodeValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| FlowError::Validation("binary data must hold bytes".into()))
                })
                .collect(),
            _ => Err(FlowError::Validation(
                "binary records need a string or an array of bytes".into(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::git::GitError;
    use crate::core::template::Bindings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGit {
        commits: Mutex<Vec<(PathBuf, Vec<PathBuf>, String)>>,
    }

    #[async_trait]
    impl GitCollaborator for FakeGit {
        async fn commit_files(
            &self,
            repo_dir: &Path,
            files: &[PathBuf],
            message: &str,
        ) -> Result<bool, GitError> {
            self.commits
                .lock()
                .unwrap()
                .push((repo_dir.to_path_buf(), files.to_vec(), message.to_string()));
            Ok(true)
        }
    }

    fn vars() -> Bindings {
        Bindings::from([
            ("node_hier".to_string(), json!("flow/step")),
            ("run_id".to_string(), json!("run_1")),
        ])
    }

    #[tokio::test]
    async fn test_records_json_under_node_dir() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), dir.path().join("outcome"), Arc::new(FakeGit::default()));
        let vars = vars();
        let scope = TemplateScope::new(&vars);

        let settings = RecordSettings::in_node_dir("outcome.json", FileFormat::Json);
        let ok = recorder
            .record("step", &json!({"text": "hi"}), RecordType::Outcome, &settings, None, &scope)
            .await;
        assert!(ok);

        let written = std::fs::read_to_string(dir.path().join("flow/step/outcome.json")).unwrap();
        let parsed: NodeValue = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_yaml_and_text_formats() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), dir.path().join("outcome"), Arc::new(FakeGit::default()));
        let vars = vars();
        let scope = TemplateScope::new(&vars);

        let yaml = RecordSettings::new("out", "data.yaml", FileFormat::Yaml);
        assert!(recorder.record("step", &json!({"a": 1}), RecordType::Output, &yaml, None, &scope).await);
        let text = std::fs::read_to_string(dir.path().join("out/data.yaml")).unwrap();
        assert!(text.contains("a: 1"));

        let plain = RecordSettings::new("out", "note.txt", FileFormat::Text);
        assert!(recorder.record("step", &json!("hello"), RecordType::Output, &plain, None, &scope).await);
        assert_eq!(std::fs::read_to_string(dir.path().join("out/note.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_failures_return_false() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ArtifactRecorder::new(dir.path(), dir.path().join("outcome"), Arc::new(FakeGit::default()));
        let vars = vars();
        let scope = TemplateScope::new(&vars);

        let unresolved = RecordSettings::new("$var{missing}", "x.json", FileFormat::Json);
        assert!(!recorder.record("step", &json!(1), RecordType::Output, &unresolved, None, &scope).await);

        let escaping = RecordSettings::new("../elsewhere", "x.json", FileFormat::Json);
        assert!(!recorder.record("step", &json!(1), RecordType::Output, &escaping, None, &scope).await);

        let binary = RecordSettings::new("out", "x.bin", FileFormat::Binary);
        assert!(!recorder.record("step", &json!({"no": "bytes"}), RecordType::Output, &binary, None, &scope).await);

        let disabled = RecordSettings::new("out", "x.json", FileFormat::Json).disabled();
        assert!(!recorder.record("step", &json!(1), RecordType::Output, &disabled, None, &scope).await);
    }

    #[tokio::test]
    async fn test_commit_goes_to_outcome_repo() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::default());
        let repo = dir.path().join("outcome");
        let recorder = ArtifactRecorder::new(dir.path().join("run"), &repo, git.clone());
        let vars = vars();
        let scope = TemplateScope::new(&vars);

        let settings = RecordSettings::in_node_dir("outcome.json", FileFormat::Json);
        let git_settings = GitSettings {
            commit: true,
            commit_message: None,
        };
        assert!(
            recorder
                .record("step", &json!(1), RecordType::Outcome, &settings, Some(&git_settings), &scope)
                .await
        );

        assert!(repo.join("flow/step/outcome.json").is_file());
        assert!(dir.path().join("run/flow/step/outcome.json").is_file());
        let commits = git.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, repo);
        assert_eq!(commits[0].1, vec![repo.join("flow/step/outcome.json")]);
        assert_eq!(commits[0].2, "run_1: record flow/step");
    }

    #[tokio::test]
    async fn test_results_stay_in_run_dir_when_committing() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::default());
        let repo = dir.path().join("outcome");
        let recorder = ArtifactRecorder::new(dir.path().join("run"), &repo, git.clone());
        let vars = vars();
        let scope = TemplateScope::new(&vars);

        let settings = RecordSettings::in_node_dir("result.json", FileFormat::Json);
        let git_settings = GitSettings {
            commit: true,
            commit_message: None,
        };
        assert!(
            recorder
                .record("step", &json!({"status": "completed"}), RecordType::Output, &settings, Some(&git_settings), &scope)
                .await
        );

        assert!(dir.path().join("run/flow/step/result.json").is_file());
        assert!(!repo.join("flow/step/result.json").exists());
        assert!(git.commits.lock().unwrap().is_empty());
    }
}
