//! Agent runners.
//!
//! The eval runner only sees the [`AgentRunner`] trait. Which implementation
//! is used comes from `config.agent` in the eval document ([`AgentSpec`]).

mod command;

pub use command::{CommandAgent, CommandAgentSpec, EchoAgent};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::mcp::McpServerInfo;

/// Errors from running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to create temporary directory for agent execution: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("failed to spawn agent command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent exited with {status}: {output}")]
    Failed { status: String, output: String },

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent run cancelled")]
    Cancelled,

    #[error("invalid agent config: {0}")]
    InvalidSpec(String),
}

/// A tool call as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
}

/// Token counts for one agent run. `error` is set when counting was not
/// possible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TokenEstimate {
    pub fn unsupported(runner: &str) -> Self {
        Self {
            error: format!("token estimation not supported for {} runner", runner),
            ..Default::default()
        }
    }
}

/// What an agent produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResult {
    /// Everything the agent printed.
    pub output: String,
    pub final_message: String,
    pub tool_calls: Vec<ToolCallSummary>,
    pub thinking: String,
    pub token_estimate: TokenEstimate,
}

impl AgentResult {
    /// A result for runners that only have raw text output.
    pub fn from_output(output: impl Into<String>, runner: &str) -> Self {
        let output = output.into();
        Self {
            final_message: output.clone(),
            output,
            token_estimate: TokenEstimate::unsupported(runner),
            ..Default::default()
        }
    }
}

/// Runs a prompt through an agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_task(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        mcp: &dyn McpServerInfo,
    ) -> Result<AgentResult, AgentError>;

    fn name(&self) -> &str;
}

/// `config.agent` of an eval document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentSpec {
    /// A shell command template.
    Command(CommandAgentSpec),
    /// Echoes the prompt back. Useful to dry-run task files.
    Noop,
}

impl AgentSpec {
    pub fn build(&self) -> Result<Arc<dyn AgentRunner>, AgentError> {
        match self {
            AgentSpec::Command(spec) => Ok(Arc::new(CommandAgent::new(spec.clone())?)),
            AgentSpec::Noop => Ok(Arc::new(EchoAgent)),
        }
    }
}
