//! Folder analysis node: directory trees, file details, glob search and structure
//! diagrams, all relative to a base directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use walkdir::WalkDir;

use crate::core::NodeValue;
use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::ResourceConfig;
use crate::core::result::{ExecutionStatus, NodeExecutionResult};

const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    AnalyzeFolder,
    AnalyzeFile,
    FindFiles,
    GetStructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderOperation {
    pub operation_type: OperationType,
    /// Template, relative to the base directory.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default = "default_true")]
    pub include_stats: bool,
    #[serde(default)]
    pub include_content: bool,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Glob for `find_files`.
    #[serde(default)]
    pub pattern: Option<String>,
}

fn default_path() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl FolderOperation {
    pub fn new(operation_type: OperationType, path: impl Into<String>) -> Self {
        Self {
            operation_type,
            path: path.into(),
            max_depth: None,
            include_hidden: false,
            include_stats: true,
            include_content: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            exclude_patterns: Vec::new(),
            pattern: None,
        }
    }

    pub fn find(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        let mut op = Self::new(OperationType::FindFiles, path);
        op.pattern = Some(pattern.into());
        op
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn include_content(mut self, include: bool) -> Self {
        self.include_content = include;
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderAnalyzerSettings {
    /// Template. Relative paths resolve against the run directory.
    pub base_directory: String,
    pub operations: Vec<FolderOperation>,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    #[serde(default)]
    pub fail_fast: bool,
}

impl FolderAnalyzerSettings {
    pub fn new(base_directory: impl Into<String>) -> Self {
        Self {
            base_directory: base_directory.into(),
            operations: Vec::new(),
            respect_gitignore: true,
            fail_fast: false,
        }
    }

    pub fn operation(mut self, operation: FolderOperation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// Totals accumulated across every operation of one node.
#[derive(Debug, Default)]
pub(crate) struct FolderStats {
    pub total_files: u64,
    pub total_directories: u64,
    pub total_size: u64,
    pub file_types: BTreeMap<String, u64>,
}

impl FolderStats {
    fn add_file(&mut self, path: &Path, size: u64) {
        self.total_files += 1;
        self.total_size += size;
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "no_extension".to_string());
        *self.file_types.entry(ext).or_default() += 1;
    }

    pub fn to_value(&self) -> NodeValue {
        json!({
            "total_files": self.total_files,
            "total_directories": self.total_directories,
            "total_size": self.total_size,
            "file_types": self.file_types,
        })
    }
}

pub struct FolderAnalyzerExecutor;

#[async_trait]
impl NodeExecutor for FolderAnalyzerExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        _input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::FolderAnalyzer(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "folder_analyzer executor received other settings".into(),
            });
        };
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "folder_analyzer");

        let base = resolve_base(context, &settings.base_directory)?;
        if !base.is_dir() {
            return Ok(result.failed(format!("base directory {} does not exist", base.display())));
        }
        let mut operations = settings.operations.clone();
        for op in &mut operations {
            op.path = context.render_string(&op.path)?;
        }

        let respect_gitignore = settings.respect_gitignore;
        let fail_fast = settings.fail_fast;
        let (results, stats) = tokio::task::spawn_blocking(move || {
            run_operations(&base, &operations, respect_gitignore, fail_fast)
        })
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))?;

        let (output, outcome, errors) = summarize(&settings.base_directory, results, &stats);
        if errors.is_empty() {
            return Ok(result.finish(ExecutionStatus::Completed, output, outcome));
        }
        let mut result = result.finish(ExecutionStatus::Failed, output, outcome);
        result.errors = errors;
        Ok(result.failed("one or more folder operations failed"))
    }
}

pub(crate) fn resolve_base(context: &ExecutionContext, template: &str) -> Result<PathBuf, FlowError> {
    let rendered = PathBuf::from(context.render_string(template)?);
    if rendered.is_absolute() {
        return Ok(rendered);
    }
    Ok(context.run().run_dir.join(rendered))
}

/// One operation's outcome, `Err` holding a message.
pub(crate) type OperationOutcome = (FolderOperation, Result<NodeValue, String>);

pub(crate) fn run_operations(
    base: &Path,
    operations: &[FolderOperation],
    respect_gitignore: bool,
    fail_fast: bool,
) -> (Vec<OperationOutcome>, FolderStats) {
    let gitignore = if respect_gitignore {
        load_gitignore(base)
    } else {
        Vec::new()
    };
    let mut stats = FolderStats::default();
    let mut results = Vec::with_capacity(operations.len());
    for op in operations {
        let outcome = run_operation(base, op, &gitignore, &mut stats);
        let failed = outcome.is_err();
        if let Err(e) = &outcome {
            log::warn!("Folder operation {:?} on '{}' failed: {e}", op.operation_type, op.path);
        }
        results.push((op.clone(), outcome));
        if failed && fail_fast {
            break;
        }
    }
    (results, stats)
}

pub(crate) fn summarize(
    base_directory: &str,
    results: Vec<OperationOutcome>,
    stats: &FolderStats,
) -> (NodeValue, NodeValue, Vec<String>) {
    let mut errors = Vec::new();
    let entries: Vec<NodeValue> = results
        .into_iter()
        .map(|(op, outcome)| match outcome {
            Ok(value) => json!({
                "operation_type": op.operation_type,
                "path": op.path,
                "success": true,
                "result": value,
            }),
            Err(e) => {
                errors.push(format!("{:?} '{}': {e}", op.operation_type, op.path));
                json!({
                    "operation_type": op.operation_type,
                    "path": op.path,
                    "success": false,
                    "error": e,
                })
            }
        })
        .collect();

    let successful = entries.len() - errors.len();
    let output = json!({ "base_directory": base_directory, "results": entries });
    let mut outcome = stats.to_value();
    if let NodeValue::Object(map) = &mut outcome {
        map.insert("base_directory".into(), json!(base_directory));
        map.insert("operations_count".into(), json!(entries.len()));
        map.insert("successful_operations".into(), json!(successful));
        map.insert("failed_operations".into(), json!(errors.len()));
        map.insert("results".into(), NodeValue::Array(entries));
    }
    (output, outcome, errors)
}

fn run_operation(
    base: &Path,
    op: &FolderOperation,
    gitignore: &[String],
    stats: &mut FolderStats,
) -> Result<NodeValue, String> {
    let target = join_within(base, &op.path)?;
    if !target.exists() {
        return Err(format!("path {} does not exist", target.display()));
    }

    let mut patterns = op.exclude_patterns.clone();
    patterns.extend(gitignore.iter().cloned());
    let walker = Walker {
        root: base,
        op,
        excludes: build_globset(&patterns)?,
    };

    match op.operation_type {
        OperationType::AnalyzeFolder => {
            if !target.is_dir() {
                return Err("analyze_folder needs a directory".into());
            }
            let tree = walker.tree(&target, 0, true, stats);
            Ok(json!({ "tree": tree, "stats": stats.to_value() }))
        }
        OperationType::AnalyzeFile => {
            if !target.is_file() {
                return Err("analyze_file needs a file".into());
            }
            let info = walker.file_info(&target, true).map_err(|e| e.to_string())?;
            if let Some(size) = info.get("size").and_then(NodeValue::as_u64) {
                stats.add_file(&target, size);
            }
            Ok(info)
        }
        OperationType::FindFiles => {
            let pattern = op.pattern.as_deref().unwrap_or("*");
            walker.find(&target, pattern)
        }
        OperationType::GetStructure => {
            if !target.is_dir() {
                return Err("get_structure needs a directory".into());
            }
            let mut scratch = FolderStats::default();
            let tree = walker.tree(&target, 0, false, &mut scratch);
            let mut diagram = vec![display_name(&target)];
            walker.diagram(&target, "", 0, &mut diagram);
            Ok(json!({ "tree": tree, "tree_diagram": diagram.join("\n") }))
        }
    }
}

/// Joins `relative` onto `base`, refusing paths that climb out of it.
fn join_within(base: &Path, relative: &str) -> Result<PathBuf, String> {
    let path = Path::new(relative);
    if path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("path '{relative}' must stay inside the base directory"));
    }
    Ok(base.join(path))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| e.to_string())
}

/// Converts the base directory's `.gitignore` into glob patterns. Negations are not
/// supported and are skipped.
fn load_gitignore(base: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(base.join(".gitignore")) else {
        return Vec::new();
    };
    let mut patterns = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let anchored = line.starts_with('/');
        let trimmed = line.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if anchored || trimmed.contains('/') {
            patterns.push(trimmed.to_string());
            patterns.push(format!("{trimmed}/**"));
        } else {
            patterns.push(format!("**/{trimmed}"));
            patterns.push(format!("**/{trimmed}/**"));
            patterns.push(trimmed.to_string());
        }
    }
    patterns
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

struct Walker<'a> {
    root: &'a Path,
    op: &'a FolderOperation,
    excludes: GlobSet,
}

impl Walker<'_> {
    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let name = display_name(path);
        if !self.op.include_hidden && name.starts_with('.') {
            return true;
        }
        self.excludes.is_match(&name) || self.excludes.is_match(self.relative(path))
    }

    fn children(&self, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .filter(|path| !self.is_excluded(path))
            .collect()
    }

    fn tree(&self, path: &Path, depth: usize, with_files: bool, stats: &mut FolderStats) -> NodeValue {
        if path.is_file() {
            return match self.file_info(path, with_files) {
                Ok(info) => {
                    stats.add_file(path, info.get("size").and_then(NodeValue::as_u64).unwrap_or(0));
                    info
                }
                Err(e) => json!({ "name": display_name(path), "type": "file", "error": e.to_string() }),
            };
        }

        stats.total_directories += 1;
        let mut node = json!({
            "name": display_name(path),
            "path": self.relative(path),
            "type": "directory",
        });
        if self.op.max_depth.is_some_and(|max| depth >= max) {
            node["truncated"] = json!(true);
            return node;
        }
        let children: Vec<NodeValue> = self
            .children(path)
            .iter()
            .map(|child| self.tree(child, depth + 1, with_files, stats))
            .collect();
        node["children"] = NodeValue::Array(children);
        node
    }

    fn file_info(&self, path: &Path, detailed: bool) -> std::io::Result<NodeValue> {
        let metadata = fs::metadata(path)?;
        let size = metadata.len();
        let mut info = json!({
            "name": display_name(path),
            "path": self.relative(path),
            "type": "file",
            "size": size,
        });
        if !detailed {
            return Ok(info);
        }
        if let Some(ext) = path.extension() {
            info["extension"] = json!(ext.to_string_lossy());
        }
        if self.op.include_stats {
            if let Ok(modified) = metadata.modified() {
                info["modified"] = json!(chrono::DateTime::<chrono::Utc>::from(modified).to_rfc3339());
            }
        }
        if size <= self.op.max_file_size {
            if let Ok(text) = fs::read_to_string(path) {
                if self.op.include_stats {
                    info["line_count"] = json!(text.lines().count());
                    info["word_count"] = json!(text.split_whitespace().count());
                }
                if self.op.include_content {
                    info["content"] = json!(text);
                }
            } else {
                info["binary"] = json!(true);
            }
        } else if self.op.include_content {
            info["content_skipped"] = json!(format!("file exceeds {} bytes", self.op.max_file_size));
        }
        Ok(info)
    }

    fn find(&self, target: &Path, pattern: &str) -> Result<NodeValue, String> {
        let matcher = Glob::new(pattern)
            .map_err(|e| format!("invalid pattern '{pattern}': {e}"))?
            .compile_matcher();
        let max_depth = self.op.max_depth.unwrap_or(usize::MAX);
        let matches: Vec<String> = WalkDir::new(target)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_excluded(entry.path()))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                matcher.is_match(entry.file_name()) || matcher.is_match(self.relative(entry.path()))
            })
            .map(|entry| self.relative(entry.path()))
            .collect();
        Ok(json!({ "pattern": pattern, "count": matches.len(), "matches": matches }))
    }

    fn diagram(&self, dir: &Path, prefix: &str, depth: usize, lines: &mut Vec<String>) {
        if self.op.max_depth.is_some_and(|max| depth >= max) {
            return;
        }
        let children = self.children(dir);
        let last = children.len().saturating_sub(1);
        for (i, child) in children.iter().enumerate() {
            let (branch, extension) = if i == last {
                ("└── ", "    ")
            } else {
                ("├── ", "│   ")
            };
            let suffix = if child.is_dir() { "/" } else { "" };
            lines.push(format!("{prefix}{branch}{}{suffix}", display_name(child)));
            if child.is_dir() {
                self.diagram(child, &format!("{prefix}{extension}"), depth + 1, lines);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("README.md"), "hello world\nsecond line\n").unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("src/nested/lib.rs"), "pub fn f() {}\n").unwrap();
        fs::write(dir.path().join("target/out.bin"), "x").unwrap();
        fs::write(dir.path().join(".hidden"), "secret").unwrap();
        fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        dir
    }

    #[test]
    fn test_analyze_folder_respects_gitignore_and_hidden() {
        let dir = sample_tree();
        let ops = vec![FolderOperation::new(OperationType::AnalyzeFolder, ".")];
        let (results, stats) = run_operations(dir.path(), &ops, true, false);
        assert!(results[0].1.is_ok());
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.file_types.get("rs"), Some(&2));
        assert_eq!(stats.file_types.get("bin"), None);
    }

    #[test]
    fn test_find_files_matches_glob() {
        let dir = sample_tree();
        let ops = vec![FolderOperation::find("src", "*.rs")];
        let (results, _) = run_operations(dir.path(), &ops, true, false);
        let found = results[0].1.as_ref().unwrap();
        assert_eq!(found["count"], json!(2));
        assert_eq!(found["matches"], json!(["src/main.rs", "src/nested/lib.rs"]));
    }

    #[test]
    fn test_analyze_file_counts_lines_and_words() {
        let dir = sample_tree();
        let ops = vec![FolderOperation::new(OperationType::AnalyzeFile, "README.md").include_content(true)];
        let (results, _) = run_operations(dir.path(), &ops, true, false);
        let info = results[0].1.as_ref().unwrap();
        assert_eq!(info["line_count"], json!(2));
        assert_eq!(info["word_count"], json!(4));
        assert_eq!(info["content"], json!("hello world\nsecond line\n"));
    }

    #[test]
    fn test_get_structure_draws_tree() {
        let dir = sample_tree();
        let ops = vec![FolderOperation::new(OperationType::GetStructure, "src")];
        let (results, _) = run_operations(dir.path(), &ops, true, false);
        let diagram = results[0].1.as_ref().unwrap()["tree_diagram"].as_str().unwrap().to_string();
        assert_eq!(diagram, "src\n├── main.rs\n└── nested/\n    └── lib.rs");
    }

    #[test]
    fn test_fail_fast_stops_after_bad_operation() {
        let dir = sample_tree();
        let ops = vec![
            FolderOperation::new(OperationType::AnalyzeFile, "missing.txt"),
            FolderOperation::new(OperationType::AnalyzeFolder, "."),
        ];
        let (results, _) = run_operations(dir.path(), &ops, true, true);
        assert_eq!(results.len(), 1);

        let (results, _) = run_operations(dir.path(), &ops, true, false);
        assert_eq!(results.len(), 2);
        let (_, outcome, errors) = summarize(".", results, &FolderStats::default());
        assert_eq!(errors.len(), 1);
        assert_eq!(outcome["failed_operations"], json!(1));
    }

    #[test]
    fn test_parent_paths_are_rejected() {
        let dir = sample_tree();
        let ops = vec![FolderOperation::new(OperationType::AnalyzeFolder, "../")];
        let (results, _) = run_operations(dir.path(), &ops, true, false);
        assert!(results[0].1.is_err());
    }
}
