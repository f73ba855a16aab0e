//! Shell-command agent and the echo agent.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AgentError, AgentResult, AgentRunner};
use crate::mcp::McpServerInfo;

const DEFAULT_SHELL: &str = "/bin/bash";

fn default_name() -> String {
    "command".to_string()
}

/// `type: command` agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAgentSpec {
    #[serde(default = "default_name")]
    pub name: String,
    /// Shell command line. `{prompt}` is replaced by the shell-quoted prompt
    /// and `{mcpServers}` by the shell-quoted server targets.
    pub run_prompt: String,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Runs an agent CLI through the user's shell.
///
/// Each run gets a fresh empty working directory so the agent cannot see
/// the task files. The directory is kept when the run fails.
#[derive(Debug)]
pub struct CommandAgent {
    spec: CommandAgentSpec,
}

impl CommandAgent {
    pub fn new(spec: CommandAgentSpec) -> Result<Self, AgentError> {
        if spec.run_prompt.trim().is_empty() {
            return Err(AgentError::InvalidSpec("runPrompt must not be empty".to_string()));
        }
        Ok(Self { spec })
    }

    fn render(&self, prompt: &str, mcp: &dyn McpServerInfo) -> String {
        let servers = mcp
            .servers()
            .iter()
            .map(|s| shell_quote(&s.target()))
            .collect::<Vec<_>>()
            .join(" ");
        self.spec
            .run_prompt
            .replace("{mcpServers}", &servers)
            .replace("{prompt}", &shell_quote(prompt))
    }
}

#[async_trait]
impl AgentRunner for CommandAgent {
    async fn run_task(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        mcp: &dyn McpServerInfo,
    ) -> Result<AgentResult, AgentError> {
        let start = Instant::now();
        let workdir = tempfile::Builder::new()
            .prefix("taskcheck-agent-")
            .tempdir()
            .map_err(AgentError::TempDir)?;

        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let command_line = self.render(prompt, mcp);

        let mut cmd = Command::new(&shell);
        cmd.arg("-c")
            .arg(&command_line)
            .current_dir(workdir.path())
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(agent = %self.spec.name, workdir = %workdir.path().display(), "Starting agent");
        debug!(command = %command_line, "Agent command line");

        let child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: shell.clone(),
            source,
        })?;

        let wait = child.wait_with_output();
        let result = tokio::select! {
            res = async {
                match self.spec.timeout {
                    Some(limit) => tokio::time::timeout(limit, wait)
                        .await
                        .map_err(|_| AgentError::Timeout(limit)),
                    None => Ok(wait.await),
                }
            } => res,
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        };

        let outcome = match result {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                if output.status.success() {
                    Ok(AgentResult::from_output(combined, "shell"))
                } else {
                    Err(AgentError::Failed {
                        status: output.status.to_string(),
                        output: combined,
                    })
                }
            }
            Ok(Err(e)) => Err(AgentError::Spawn {
                command: shell,
                source: e,
            }),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => {
                debug!(agent = %self.spec.name, elapsed = ?start.elapsed(), "Agent completed");
            }
            Err(e) => {
                let kept = workdir.keep();
                warn!(
                    agent = %self.spec.name,
                    error = %e,
                    workdir = %kept.display(),
                    "Agent failed; keeping its working directory"
                );
            }
        }

        outcome
    }

    fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Returns the prompt as the answer without calling any model.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run_task(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
        _mcp: &dyn McpServerInfo,
    ) -> Result<AgentResult, AgentError> {
        Ok(AgentResult::from_output(prompt, "noop"))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Single-quotes `s` for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
