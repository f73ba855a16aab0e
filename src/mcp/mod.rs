//! MCP servers available to the agent, and the record of what it called.
//!
//! The recording proxy itself lives outside this crate. It writes into a
//! per-task [`CallRecorder`], whose [`CallHistory`] snapshot ends up in the
//! task result and feeds the assertions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum McpError {
    #[error("mcp server name must not be empty")]
    EmptyName,

    #[error("duplicate mcp server {0:?}")]
    Duplicate(String),

    #[error("mcp server {0:?} must set either url or command")]
    MissingTarget(String),
}

/// One MCP server from `config.mcpServers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub name: String,
    /// Endpoint of an HTTP server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Command of a stdio server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Tools the agent may call. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

impl McpServerConfig {
    /// How the agent should reach the server: the URL, or the command line.
    pub fn target(&self) -> String {
        match (&self.url, &self.command) {
            (Some(url), _) => url.clone(),
            (None, Some(cmd)) if self.args.is_empty() => cmd.clone(),
            (None, Some(cmd)) => format!("{} {}", cmd, self.args.join(" ")),
            (None, None) => String::new(),
        }
    }
}

/// What an agent runner may know about the MCP setup of the current task.
pub trait McpServerInfo: Send + Sync {
    fn servers(&self) -> &[McpServerConfig];

    /// Where tool, resource and prompt calls are recorded.
    fn recorder(&self) -> &CallRecorder;
}

/// The MCP servers configured for a run.
#[derive(Debug, Clone, Default)]
pub struct McpServerManager {
    servers: Vec<McpServerConfig>,
}

impl McpServerManager {
    pub fn new(servers: Vec<McpServerConfig>) -> Result<Self, McpError> {
        let mut seen = HashSet::new();
        for server in &servers {
            if server.name.is_empty() {
                return Err(McpError::EmptyName);
            }
            if !seen.insert(server.name.as_str()) {
                return Err(McpError::Duplicate(server.name.clone()));
            }
            if server.url.is_none() && server.command.is_none() {
                return Err(McpError::MissingTarget(server.name.clone()));
            }
        }
        Ok(Self { servers })
    }

    pub fn get(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn servers(&self) -> &[McpServerConfig] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// MCP view handed to the agent for one task: the run's servers plus the
/// task's own recorder.
pub struct TaskMcp<'a> {
    servers: &'a McpServerManager,
    recorder: CallRecorder,
}

impl<'a> TaskMcp<'a> {
    pub fn new(servers: &'a McpServerManager) -> Self {
        Self {
            servers,
            recorder: CallRecorder::new(),
        }
    }

    pub fn history(&self) -> CallHistory {
        self.recorder.snapshot()
    }
}

impl McpServerInfo for TaskMcp<'_> {
    fn servers(&self) -> &[McpServerConfig] {
        self.servers.servers()
    }

    fn recorder(&self) -> &CallRecorder {
        &self.recorder
    }
}

/// A single recorded MCP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub server: String,
    /// Tool name, resource URI or prompt name.
    pub name: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallRecord {
    pub fn new(server: impl Into<String>, name: impl Into<String>, success: bool) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            success,
            timestamp: Utc::now(),
            arguments: None,
            error: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Everything an agent called during one task, in call order per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistory {
    #[serde(default)]
    pub tool_calls: Vec<CallRecord>,
    #[serde(default)]
    pub resource_reads: Vec<CallRecord>,
    #[serde(default)]
    pub prompt_gets: Vec<CallRecord>,
}

impl CallHistory {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.resource_reads.is_empty() && self.prompt_gets.is_empty()
    }
}

/// Thread-safe sink for call records.
#[derive(Debug, Default)]
pub struct CallRecorder {
    history: Mutex<CallHistory>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self, record: CallRecord) {
        self.lock().tool_calls.push(record);
    }

    pub fn record_resource_read(&self, record: CallRecord) {
        self.lock().resource_reads.push(record);
    }

    pub fn record_prompt_get(&self, record: CallRecord) {
        self.lock().prompt_gets.push(record);
    }

    pub fn snapshot(&self) -> CallHistory {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallHistory> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }
}
