//! Declarative steps.
//!
//! A step config is a one-key object naming the step type, plus an optional
//! `id`:
//!
//! ```yaml
//! - id: create-ns
//!   script:
//!     inline: kubectl create namespace test-{random.id}
//! - kubernetes.listContexts: {}
//! ```
//!
//! The [`Registry`] turns configs into [`StepRunner`]s. Each runner produces a
//! [`StepOutput`]; an `Err` means the step could not run at all.

pub mod extension;
pub mod http;
pub mod llm_judge;
pub mod random;
pub mod registry;
pub mod script;
pub mod template;

pub use random::RandomResolver;
pub use registry::{PrefixParser, Registry, StepParser};
pub use template::{StepOutputResolver, StepOutputs, Template, TemplateError};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::extension::ExtensionError;
use crate::judge::{JudgeError, TokenUsage};

/// Default timeout for script and http steps.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors that stop a step from running (as opposed to a step that ran and
/// reported `success: false`).
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid step config: {0}")]
    InvalidConfig(String),

    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("failed to parse {step_type} step: {source}")]
    Parse {
        step_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to resolve {field} template: {source}")]
    Resolve {
        field: &'static str,
        #[source]
        source: TemplateError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Http(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("step cancelled")]
    Cancelled,

    #[error("script exited with {status}: {stderr}")]
    ScriptFailed { status: String, stderr: String },

    #[error("cannot run llmJudge step before agent (must be in verification)")]
    MissingAgentContext,

    #[error("failed to call llm judge: {0}")]
    Judge(#[from] JudgeError),

    #[error("{context}: {source}")]
    Extension {
        context: String,
        #[source]
        source: ExtensionError,
    },
}

/// The agent's prompt and answer, available to verify steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentContext {
    pub prompt: String,
    pub output: String,
}

/// Everything a step gets to see when it runs.
pub struct StepInput<'a> {
    pub cancel: &'a CancellationToken,
    pub workdir: &'a Path,
    pub env: &'a HashMap<String, String>,
    /// Only set during verification.
    pub agent: Option<&'a AgentContext>,
    /// Outputs of earlier successful steps in the same phase, by step type.
    pub step_outputs: &'a StepOutputs,
    pub random: &'a RandomResolver,
}

/// Result of running one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub step_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Token usage, reported by judge steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl StepOutput {
    pub fn success(step_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(step_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, String>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// An executable step.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// The step type name, used to key its outputs.
    fn step_type(&self) -> &str;

    async fn execute(&self, input: &StepInput<'_>) -> Result<StepOutput, StepError>;
}

/// One step as written in a task file.
///
/// `id` is kept apart from the remaining keys; serialization puts it back
/// when it is non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepConfig {
    pub id: String,
    pub config: Map<String, Value>,
}

impl StepConfig {
    pub fn new(step_type: impl Into<String>, payload: Value) -> Self {
        let mut config = Map::new();
        config.insert(step_type.into(), payload);
        Self {
            id: String::new(),
            config,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The single `(step type, payload)` pair.
    pub fn entry(&self) -> Result<(&str, &Value), StepError> {
        let mut iter = self.config.iter();
        match (iter.next(), iter.next()) {
            (Some((key, value)), None) => Ok((key.as_str(), value)),
            (None, _) => Err(StepError::InvalidConfig(format!(
                "step '{}' has no step type",
                self.id
            ))),
            (Some(_), Some(_)) => Err(StepError::InvalidConfig(format!(
                "step '{}' must have exactly one step type, found: {}",
                self.id,
                self.config.keys().cloned().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

impl Serialize for StepConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = self.config.clone();
        if !self.id.is_empty() {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StepConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut config = Map::<String, Value>::deserialize(deserializer)?;
        let id = match config.remove("id") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "step id must be a string, got {}",
                    other
                )))
            }
        };
        Ok(Self { id, config })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_step_config_round_trip() {
        let raw = json!({"id": "setup_0", "script": {"inline": "echo hi"}});
        let cfg: StepConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(cfg.id, "setup_0");
        assert!(!cfg.config.contains_key("id"));
        assert_eq!(cfg.entry().unwrap().0, "script");

        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back, raw);
        let again: StepConfig = serde_json::from_value(back).unwrap();
        assert_eq!(again, cfg);
    }

    #[test]
    fn test_step_config_without_id() {
        let cfg: StepConfig = serde_yaml::from_str("http:\n  url: http://localhost\n").unwrap();
        assert!(cfg.id.is_empty());
        let back = serde_json::to_value(&cfg).unwrap();
        assert!(back.get("id").is_none());
    }

    #[test]
    fn test_step_config_requires_single_type() {
        let cfg: StepConfig =
            serde_json::from_value(json!({"script": {}, "http": {}})).unwrap();
        assert!(matches!(cfg.entry(), Err(StepError::InvalidConfig(_))));

        let empty: StepConfig = serde_json::from_value(json!({"id": "x"})).unwrap();
        assert!(empty.entry().is_err());
    }

    #[test]
    fn test_step_config_rejects_non_string_id() {
        let res: Result<StepConfig, _> = serde_json::from_value(json!({"id": 3, "script": {}}));
        assert!(res.is_err());
    }

    #[test]
    fn test_step_output_serialization() {
        let out = StepOutput::success("http", "ok");
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value, json!({"type": "http", "success": true, "message": "ok"}));
    }
}
