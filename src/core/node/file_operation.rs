//! File operation node: creates, edits and deletes files and directories below a base
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::NodeValue;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::folder_analyzer::resolve_base;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::recorder::relative;
use crate::core::resource::ResourceConfig;
use crate::core::result::{ExecutionStatus, NodeExecutionResult};

/// Replaces the text between two markers. Both markers are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileModification {
    pub start_point_match: String,
    pub end_point_match: String,
    /// Use an empty string to delete the section.
    pub content: String,
}

/// One filesystem change, tagged by `type`. Paths are relative to the base directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileOperation {
    CreateDirectory {
        path: String,
    },
    DeleteDirectory {
        path: String,
    },
    CreateFile {
        path: String,
        #[serde(default)]
        content: String,
    },
    ModifyFile {
        path: String,
        content: FileModification,
    },
    DeleteFile {
        path: String,
    },
}

impl FileOperation {
    pub fn create_file(path: impl Into<String>, content: impl Into<String>) -> Self {
        FileOperation::CreateFile {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn modify_file(
        path: impl Into<String>,
        start_point_match: impl Into<String>,
        end_point_match: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        FileOperation::ModifyFile {
            path: path.into(),
            content: FileModification {
                start_point_match: start_point_match.into(),
                end_point_match: end_point_match.into(),
                content: content.into(),
            },
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileOperation::CreateDirectory { path }
            | FileOperation::DeleteDirectory { path }
            | FileOperation::CreateFile { path, .. }
            | FileOperation::ModifyFile { path, .. }
            | FileOperation::DeleteFile { path } => path,
        }
    }

    fn path_mut(&mut self) -> &mut String {
        match self {
            FileOperation::CreateDirectory { path }
            | FileOperation::DeleteDirectory { path }
            | FileOperation::CreateFile { path, .. }
            | FileOperation::ModifyFile { path, .. }
            | FileOperation::DeleteFile { path } => path,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FileOperation::CreateDirectory { .. } => "create_directory",
            FileOperation::DeleteDirectory { .. } => "delete_directory",
            FileOperation::CreateFile { .. } => "create_file",
            FileOperation::ModifyFile { .. } => "modify_file",
            FileOperation::DeleteFile { .. } => "delete_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperationSettings {
    /// Template. Relative paths resolve against the run directory.
    #[serde(default = "default_base_directory")]
    pub base_directory: String,
    /// Subdirectories of the base that operations may touch. Empty allows the whole base.
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub operations: Vec<FileOperation>,
    /// Template rendering to a list of operations (or one operation, or a JSON string of
    /// either), typically pointing at a previous node's outcome. Takes precedence over
    /// `operations` when it yields any.
    #[serde(default)]
    pub operations_template: Option<String>,
    /// Stop at the first operation that fails.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_base_directory() -> String {
    ".".to_string()
}

impl FileOperationSettings {
    pub fn new(base_directory: impl Into<String>) -> Self {
        Self {
            base_directory: base_directory.into(),
            allowed_directories: Vec::new(),
            operations: Vec::new(),
            operations_template: None,
            fail_fast: false,
        }
    }

    pub fn operation(mut self, operation: FileOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operations_template(mut self, template: impl Into<String>) -> Self {
        self.operations_template = Some(template.into());
        self
    }

    pub fn allow(mut self, directory: impl Into<String>) -> Self {
        self.allowed_directories.push(directory.into());
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

pub struct FileOperationExecutor;

#[async_trait]
impl NodeExecutor for FileOperationExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::FileOperation(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "file_operation executor received other settings".into(),
            });
        };
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "file_operation");

        let mut operations = match &settings.operations_template {
            Some(template) => match parse_operations(context.render(template)?) {
                Ok(operations) => operations,
                Err(e) => return Ok(result.failed(e)),
            },
            None => Vec::new(),
        };
        if operations.is_empty() {
            operations = settings.operations.clone();
        }
        if operations.is_empty() {
            return Ok(result.failed("no file operations specified"));
        }
        for op in &mut operations {
            let rendered = context.render_string(op.path())?;
            *op.path_mut() = rendered;
        }

        let base = resolve_base(context, &settings.base_directory)?;
        let allowed = settings.allowed_directories.clone();
        let fail_fast = settings.fail_fast;
        let outcomes = tokio::task::spawn_blocking(move || {
            run_operations(&base, &allowed, &operations, fail_fast)
        })
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))?;

        let (output, outcome, errors) = summarize(&outcomes);
        if errors.is_empty() {
            return Ok(result.finish(ExecutionStatus::Completed, output, outcome));
        }
        let message = format!("{} file operation(s) failed", errors.len());
        let mut result = result.finish(ExecutionStatus::Failed, output, outcome);
        result.errors = errors;
        Ok(result.failed(message))
    }
}

/// Accepts a list, a single operation, or a JSON string holding either.
fn parse_operations(value: NodeValue) -> Result<Vec<FileOperation>, String> {
    let value = match value {
        NodeValue::String(text) if text.trim().is_empty() => return Ok(Vec::new()),
        NodeValue::String(text) => {
            serde_json::from_str(&text).map_err(|e| format!("operations template is not JSON: {e}"))?
        }
        other => other,
    };
    let parsed = match value {
        NodeValue::Null => Ok(Vec::new()),
        NodeValue::Array(_) => serde_json::from_value(value),
        NodeValue::Object(mut map) if map.contains_key("operations") => {
            serde_json::from_value(map.remove("operations").unwrap_or_default())
        }
        other => serde_json::from_value(other).map(|op| vec![op]),
    };
    parsed.map_err(|e| format!("invalid file operation: {e}"))
}

type OperationOutcome = (FileOperation, Result<(), String>);

fn run_operations(
    base: &Path,
    allowed: &[String],
    operations: &[FileOperation],
    fail_fast: bool,
) -> Vec<OperationOutcome> {
    let mut outcomes = Vec::with_capacity(operations.len());
    for op in operations {
        let outcome = confine(base, allowed, op.path()).and_then(|target| apply(&target, op));
        let failed = outcome.is_err();
        if let Err(e) = &outcome {
            log::warn!("File operation {} on '{}' failed: {e}", op.type_name(), op.path());
        }
        outcomes.push((op.clone(), outcome));
        if failed && fail_fast {
            break;
        }
    }
    outcomes
}

/// Resolves `path` below `base`, refusing the base itself and anything outside the
/// allowed subdirectories.
fn confine(base: &Path, allowed: &[String], path: &str) -> Result<PathBuf, String> {
    let relative_path = relative(path).map_err(|e| e.to_string())?;
    let normalized: PathBuf = relative_path.components().collect();
    if normalized.as_os_str().is_empty() || normalized == Path::new(".") {
        return Err("operations may not target the base directory itself".into());
    }
    if !allowed.is_empty() {
        let permitted = allowed.iter().any(|dir| {
            relative(dir)
                .map(|dir| normalized.starts_with(dir.components().collect::<PathBuf>()))
                .unwrap_or(false)
        });
        if !permitted {
            return Err(format!("path '{path}' is outside the allowed directories"));
        }
    }
    Ok(base.join(normalized))
}

fn apply(target: &Path, op: &FileOperation) -> Result<(), String> {
    let io = |e: std::io::Error| e.to_string();
    match op {
        FileOperation::CreateDirectory { .. } => fs::create_dir_all(target).map_err(io),
        FileOperation::CreateFile { content, .. } => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::write(target, content).map_err(io)
        }
        FileOperation::ModifyFile { path, content } => {
            if !target.is_file() {
                return Err(format!("file does not exist: {path}"));
            }
            let text = fs::read_to_string(target).map_err(io)?;
            let modified = splice(&text, content)
                .ok_or_else(|| format!("could not find modification points in {path}"))?;
            fs::write(target, modified).map_err(io)
        }
        FileOperation::DeleteFile { path } => {
            if !target.is_file() {
                return Err(format!("file does not exist: {path}"));
            }
            fs::remove_file(target).map_err(io)
        }
        FileOperation::DeleteDirectory { path } => {
            if !target.is_dir() {
                return Err(format!("directory does not exist: {path}"));
            }
            fs::remove_dir_all(target).map_err(io)
        }
    }
}

/// Replaces everything between the first start marker and the next end marker.
fn splice(text: &str, modification: &FileModification) -> Option<String> {
    let start = text.find(&modification.start_point_match)? + modification.start_point_match.len();
    let end = start + text[start..].find(&modification.end_point_match)?;
    Some(format!("{}{}{}", &text[..start], modification.content, &text[end..]))
}

fn summarize(outcomes: &[OperationOutcome]) -> (NodeValue, NodeValue, Vec<String>) {
    let mut errors = Vec::new();
    let results: Vec<NodeValue> = outcomes
        .iter()
        .map(|(op, outcome)| match outcome {
            Ok(()) => json!({ "type": op.type_name(), "path": op.path(), "success": true }),
            Err(e) => {
                errors.push(format!("{} '{}': {e}", op.type_name(), op.path()));
                json!({ "type": op.type_name(), "path": op.path(), "success": false, "error": e })
            }
        })
        .collect();

    let all_succeeded = errors.is_empty();
    let count = results.len();
    let output = json!({
        "success": all_succeeded,
        "operations_count": count,
        "results": results,
    });
    let outcome = json!({
        "success": all_succeeded,
        "operations_count": count,
        "successful_operations": count - errors.len(),
        "failed_operations": errors.len(),
        "errors": errors,
    });
    (output, outcome, errors)
}
