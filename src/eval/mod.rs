//! Evaluations: a set of tasks run against one agent.

pub mod assertions;
pub mod config;
pub mod discovery;
pub mod progress;
pub mod runner;

pub use assertions::{AssertionResult, CompositeAssertionResult, TaskAssertions, ToolAssertion};
pub use config::{EvalConfig, EvalSpec, TaskSet, KIND_EVAL};
pub use discovery::DiscoveredTask;
pub use progress::{LogProgress, NoopProgress, ProgressCallback, ProgressEvent, ProgressEventType};
pub use runner::{EvalResult, EvalRunner, CANCELLED};

use thiserror::Error;

use crate::agent::AgentError;
use crate::error::ConfigError;
use crate::extension::ExtensionError;
use crate::judge::JudgeError;
use crate::mcp::McpError;

/// Errors that fail a whole evaluation. Failures of single tasks end up in
/// their [`EvalResult`] instead.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("failed to compile regexp for task name match: {0}")]
    InvalidPattern(#[source] regex::Error),

    #[error("failed to glob {pattern}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to load task at path {path}: {source}")]
    LoadTask {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create mcp manager: {0}")]
    Mcp(#[source] McpError),

    #[error("agent must be specified in eval config")]
    MissingAgent,

    #[error("failed to create agent runner from spec: {0}")]
    Agent(#[source] AgentError),

    #[error("failed to create llm judge from spec: {0}")]
    Judge(#[source] JudgeError),

    #[error("registering extension {alias:?}: {source}")]
    RegisterExtension {
        alias: String,
        #[source]
        source: ExtensionError,
    },

    /// The run was interrupted. Results collected so far are still saved.
    #[error("evaluation cancelled")]
    Cancelled,
}
