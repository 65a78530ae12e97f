//! Thin wrapper over the `git` binary.
//!
//! The recorder only needs "stage these files and commit them"; the repository analyzer
//! reads history and branches. Both go through [`GitRepo`].

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("not a git repository: {0}")]
    NotARepository(String),
}

/// Commits recorded artifacts into an outcome repository.
#[async_trait]
pub trait GitCollaborator: Send + Sync {
    /// Stages `files` (relative to or inside `repo_dir`) and commits them.
    ///
    /// Returns `Ok(false)` when there was nothing to commit.
    async fn commit_files(
        &self,
        repo_dir: &Path,
        files: &[PathBuf],
        message: &str,
    ) -> Result<bool, GitError>;
}

/// The default collaborator: shells out to `git`, initialising the repository on first
/// use.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

#[async_trait]
impl GitCollaborator for GitCli {
    async fn commit_files(
        &self,
        repo_dir: &Path,
        files: &[PathBuf],
        message: &str,
    ) -> Result<bool, GitError> {
        let repo = GitRepo::new(repo_dir);
        repo.ensure_initialized().await?;
        repo.add(files).await?;
        repo.commit_staged(message).await
    }
}

/// One parsed `git log` line.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommitEntry {
    pub hash: String,
    pub date: String,
    pub author: Option<String>,
    pub subject: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    workdir: PathBuf,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repository(&self) -> bool {
        self.workdir.join(".git").is_dir()
    }

    pub async fn ensure_initialized(&self) -> Result<(), GitError> {
        if self.is_repository() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.workdir).await?;
        log::info!("Initialising git repository at {}", self.workdir.display());
        self.run_checked(&["init", "--quiet"]).await?;
        Ok(())
    }

    pub async fn add(&self, files: &[PathBuf]) -> Result<(), GitError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--".to_string()];
        for file in files {
            let relative = file.strip_prefix(&self.workdir).unwrap_or(file);
            args.push(relative.to_string_lossy().into_owned());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args).await?;
        Ok(())
    }

    pub async fn has_staged_changes(&self) -> Result<bool, GitError> {
        let out = self.run(&["diff", "--cached", "--name-only"]).await?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commits whatever is staged. Returns `Ok(false)` and does nothing if the index is
    /// clean.
    pub async fn commit_staged(&self, message: &str) -> Result<bool, GitError> {
        if !self.has_staged_changes().await? {
            log::debug!("No staged changes in {}, skipping commit", self.workdir.display());
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "-m", message]).await?;
        Ok(true)
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    pub async fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let out = self
            .run_capture(&["branch", "--list", "--format=%(refname:short)"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Reads `git log` for `branch` (or HEAD), newest first.
    pub async fn log(
        &self,
        branch: Option<&str>,
        max_count: Option<usize>,
        with_author: bool,
    ) -> Result<Vec<CommitEntry>, GitError> {
        let format = if with_author {
            "--format=%h|%ad|%an|%s"
        } else {
            "--format=%h|%ad|%s"
        };
        let mut args = vec!["log".to_string(), format.to_string(), "--date=iso".to_string()];
        if let Some(max) = max_count {
            args.push(format!("--max-count={max}"));
        }
        if let Some(branch) = branch {
            args.push(branch.to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_capture(&args).await?;

        Ok(out
            .lines()
            .filter_map(|line| parse_log_line(line, with_author))
            .collect())
    }

    pub async fn run_capture(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output, GitError> {
        let out = self.run(args).await?;
        if out.status.success() {
            return Ok(out);
        }
        Err(GitError::Command {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        log::debug!("git {} (in {})", args.join(" "), self.workdir.display());
        Ok(Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await?)
    }
}

fn parse_log_line(line: &str, with_author: bool) -> Option<CommitEntry> {
    let expected = if with_author { 4 } else { 3 };
    let parts: Vec<&str> = line.splitn(expected, '|').collect();
    if parts.len() != expected {
        return None;
    }
    let (author, subject) = if with_author {
        (Some(parts[2].to_string()), parts[3])
    } else {
        (None, parts[2])
    };
    Some(CommitEntry {
        hash: parts[0].to_string(),
        date: parts[1].to_string(),
        author,
        subject: subject.to_string(),
    })
}
