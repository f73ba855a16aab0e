//! Step type registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::extension::ExtensionPrefixParser;
use super::http::HttpStep;
use super::llm_judge::LlmJudgeStep;
use super::script::ScriptStep;
use super::{StepConfig, StepError, StepRunner};
use crate::extension::ExtensionManager;
use crate::judge::LlmJudge;

/// Parses the payload of a fixed step type.
pub type StepParser = Arc<dyn Fn(&Value) -> Result<Box<dyn StepRunner>, StepError> + Send + Sync>;

/// Parses `<prefix>.<operation>` step types.
///
/// Async because resolving an operation may need to start the process that
/// declares it.
#[async_trait]
pub trait PrefixParser: Send + Sync {
    async fn parse(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        payload: &Value,
    ) -> Result<Box<dyn StepRunner>, StepError>;
}

/// Rejects steps addressed to an MCP server alias.
struct McpPrefixParser {
    alias: String,
}

#[async_trait]
impl PrefixParser for McpPrefixParser {
    async fn parse(
        &self,
        _cancel: &CancellationToken,
        operation: &str,
        _payload: &Value,
    ) -> Result<Box<dyn StepRunner>, StepError> {
        Err(StepError::InvalidConfig(format!(
            "step '{}.{}' targets MCP server '{}'; MCP servers cannot be used as step types",
            self.alias, operation, self.alias
        )))
    }
}

/// Maps step type names to parsers.
///
/// Cloning is cheap. The run keeps one registry with the built-in types and
/// each task clones it and adds the prefixes for its own requirements.
#[derive(Clone, Default)]
pub struct Registry {
    parsers: HashMap<String, StepParser>,
    prefixes: HashMap<String, Arc<dyn PrefixParser>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `script`, `http` and `llmJudge`.
    pub fn builtin(judge: Arc<dyn LlmJudge>) -> Self {
        let mut registry = Self::new();
        registry.register(ScriptStep::TYPE, Arc::new(parse_script));
        registry.register(HttpStep::TYPE, Arc::new(parse_http));
        registry.register(
            LlmJudgeStep::TYPE,
            Arc::new(move |raw: &Value| -> Result<Box<dyn StepRunner>, StepError> {
                Ok(Box::new(LlmJudgeStep::parse(raw, Arc::clone(&judge))?))
            }),
        );
        registry
    }

    pub fn register(&mut self, step_type: &str, parser: StepParser) {
        self.parsers.insert(step_type.to_string(), parser);
    }

    pub fn register_prefix(&mut self, prefix: &str, parser: Arc<dyn PrefixParser>) {
        self.prefixes.insert(prefix.to_string(), parser);
    }

    /// Adds one prefix per extension requirement. `aliases` maps the alias a
    /// task uses in its steps to the extension name registered with the
    /// manager.
    pub fn with_extensions(
        mut self,
        manager: &Arc<ExtensionManager>,
        aliases: &HashMap<String, String>,
    ) -> Self {
        for (alias, extension) in aliases {
            self.register_prefix(
                alias,
                Arc::new(ExtensionPrefixParser::new(
                    Arc::clone(manager),
                    alias.clone(),
                    extension.clone(),
                )),
            );
        }
        self
    }

    /// Reserves MCP server aliases so steps using them fail with a clear
    /// message instead of "unknown step type".
    pub fn with_mcp_servers<'a>(mut self, aliases: impl IntoIterator<Item = &'a String>) -> Self {
        for alias in aliases {
            self.register_prefix(
                alias,
                Arc::new(McpPrefixParser {
                    alias: alias.clone(),
                }),
            );
        }
        self
    }

    pub fn has(&self, step_type: &str) -> bool {
        self.parsers.contains_key(step_type)
    }

    /// Builds the runner for one step config.
    ///
    /// Exact type names win. Otherwise the type is split on its first dot and
    /// the part before it is looked up as a prefix.
    pub async fn parse(
        &self,
        cancel: &CancellationToken,
        cfg: &StepConfig,
    ) -> Result<Box<dyn StepRunner>, StepError> {
        let (step_type, payload) = cfg.entry()?;

        if let Some(parser) = self.parsers.get(step_type) {
            return parser(payload);
        }

        if let Some((prefix, operation)) = step_type.split_once('.') {
            if let Some(parser) = self.prefixes.get(prefix) {
                debug!(step_type, prefix, operation, "Parsing prefixed step");
                return parser.parse(cancel, operation, payload).await;
            }
        }

        Err(StepError::UnknownStepType(step_type.to_string()))
    }
}

fn parse_script(raw: &Value) -> Result<Box<dyn StepRunner>, StepError> {
    Ok(Box::new(ScriptStep::parse(raw)?))
}

fn parse_http(raw: &Value) -> Result<Box<dyn StepRunner>, StepError> {
    Ok(Box::new(HttpStep::parse(raw)?))
}
