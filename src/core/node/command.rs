//! Shell command node.
//!
//! Commands run one after another through `<shell> -c`, each under its own timeout.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;

use crate::core::context::ExecutionContext;
use crate::core::error::FlowError;
use crate::core::node::{NodeDefinition, NodeExecutor, NodeInput, NodeSettings};
use crate::core::resource::ResourceConfig;
use crate::core::result::{ExecutionStatus, NodeExecutionResult};

const TIMEOUT_ERROR: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Command templates, executed in order.
    pub commands: Vec<String>,
    /// Working directory template. Defaults to the run directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Stop at the first command that fails or times out.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_fail_fast() -> bool {
    true
}

fn default_shell() -> String {
    "sh".to_string()
}

impl CommandSettings {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            working_dir: None,
            env_vars: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            fail_fast: default_fail_fast(),
            shell: default_shell(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(name.into(), value.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// The record of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    /// `None` when the process was killed or never started.
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct CommandExecutor;

#[async_trait]
impl NodeExecutor for CommandExecutor {
    async fn execute_node(
        &self,
        node_id: &str,
        definition: &NodeDefinition,
        context: &mut ExecutionContext,
        input: Option<NodeInput>,
        _resource: Option<ResourceConfig>,
    ) -> Result<NodeExecutionResult, FlowError> {
        let NodeSettings::Command(settings) = &definition.settings else {
            return Err(FlowError::InvalidInput {
                node_id: node_id.to_string(),
                message: "command executor received non-command settings".into(),
            });
        };
        let result = NodeExecutionResult::running(node_id, context.current_hier(), "command");

        let working_dir = match &settings.working_dir {
            Some(dir) => context.render_string(dir)?,
            None => context.run().run_dir.to_string_lossy().into_owned(),
        };
        let mut env = HashMap::with_capacity(settings.env_vars.len());
        for (name, value) in &settings.env_vars {
            env.insert(name.clone(), context.render_string(value)?);
        }
        if let Some(input) = input {
            env.extend(input.env_vars);
        }
        let commands = settings
            .commands
            .iter()
            .map(|command| context.render_string(command))
            .collect::<Result<Vec<_>, _>>()?;

        let timeout = Duration::from_secs(settings.timeout_secs);
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let step = run_command(&settings.shell, &command, &working_dir, &env, timeout).await;
            let failed = !step.success;
            results.push(step);
            if failed && settings.fail_fast {
                log::info!("Command node '{node_id}' stopping after a failed command");
                break;
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let all_succeeded = failed == 0;
        let results = serde_json::to_value(&results)?;

        let output = json!({ "all_succeeded": all_succeeded, "results": results });
        let outcome = json!({
            "all_succeeded": all_succeeded,
            "commands_executed": successful + failed,
            "successful_commands": successful,
            "failed_commands": failed,
            "results": results,
        });

        if all_succeeded {
            return Ok(result.finish(ExecutionStatus::Completed, output, outcome));
        }
        Ok(result
            .finish(ExecutionStatus::Failed, output, outcome)
            .failed(format!("{failed} command(s) failed")))
    }
}

async fn run_command(
    shell: &str,
    command: &str,
    working_dir: &str,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> CommandResult {
    log::debug!("{shell} -c: {}", command.chars().take(80).collect::<String>());

    let child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .envs(env)
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return CommandResult {
                command: command.to_string(),
                returncode: None,
                stdout: String::new(),
                stderr: String::new(),
                success: false,
                error: Some(format!("Failed to spawn: {e}")),
            };
        }
    };

    // Dropping the pending wait on timeout kills the child.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let success = output.status.success();
            CommandResult {
                command: command.to_string(),
                returncode: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                success,
                error: (!success).then(|| format!("exit status {}", output.status)),
            }
        }
        Ok(Err(e)) => CommandResult {
            command: command.to_string(),
            returncode: None,
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            error: Some(format!("Failed to wait: {e}")),
        },
        Err(_) => {
            log::warn!("Command timed out after {}s: {command}", timeout.as_secs());
            CommandResult {
                command: command.to_string(),
                returncode: None,
                stdout: String::new(),
                stderr: "Command execution timed out".to_string(),
                success: false,
                error: Some(TIMEOUT_ERROR.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        let result = run_command(
            "sh",
            "echo $GREETING; echo oops >&2",
            &dir.path().to_string_lossy(),
            &env,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.returncode, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_failed_step() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_command("sh", "exit 3", &dir.path().to_string_lossy(), &HashMap::new(), Duration::from_secs(5)).await;
        assert!(!result.success);
        assert_eq!(result.returncode, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_command("sh", "sleep 5", &dir.path().to_string_lossy(), &HashMap::new(), Duration::from_millis(100)).await;
        assert!(!result.success);
        assert_eq!(result.returncode, None);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings: CommandSettings = serde_json::from_value(json!({"commands": ["ls"]})).unwrap();
        assert_eq!(settings.timeout_secs, 60);
        assert!(settings.fail_fast);
        assert_eq!(settings.shell, "sh");
    }
}
