//! LLM judge: semantic evaluation of an agent's answer against a reference.
//!
//! Backends form a closed set ([`JudgeBackend`]) chosen once per run by
//! [`create_judge`] from environment variables named in the eval config.

mod claude;
mod openai;

pub use claude::ClaudeCliJudge;
pub use openai::OpenAiJudge;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const JUDGE_TYPE_OPENAI: &str = "openai";
pub const JUDGE_TYPE_CLAUDE: &str = "claude";

/// Errors from judge construction and evaluation.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("llm judge env config is required to create an llm judge")]
    MissingEnvConfig,

    #[error("missing required environment variables for LLM judge: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("unsupported judge type: {0} (supported types: openai, claude)")]
    UnsupportedType(String),

    #[error("'claude' binary not found in PATH; install the Claude Code CLI to use the claude judge")]
    ClaudeNotFound,

    #[error("{0}")]
    InvalidCriteria(String),

    #[error("judge request failed: {0}")]
    Request(String),

    #[error("judge API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("failed to parse judge response: {0}")]
    Parse(String),

    #[error("judge evaluation cancelled")]
    Cancelled,
}

/// Reference answer for one `llmJudge` step. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeCriteria {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contains: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exact: String,
}

/// How the reference answer is compared with the agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    Exact,
    Contains,
}

impl std::fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationMode::Exact => write!(f, "EXACT"),
            EvaluationMode::Contains => write!(f, "CONTAINS"),
        }
    }
}

impl JudgeCriteria {
    pub fn validate(&self) -> Result<(), JudgeError> {
        match (self.contains.is_empty(), self.exact.is_empty()) {
            (true, true) => Err(JudgeError::InvalidCriteria(
                "one of contains or exact must be specified".to_string(),
            )),
            (false, false) => Err(JudgeError::InvalidCriteria(
                "only one of contains or exact can be specified, not both".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn evaluation_mode(&self) -> EvaluationMode {
        if self.exact.is_empty() {
            EvaluationMode::Contains
        } else {
            EvaluationMode::Exact
        }
    }

    pub fn reference_answer(&self) -> &str {
        if self.exact.is_empty() {
            &self.contains
        } else {
            &self.exact
        }
    }
}

/// Token usage reported by a judge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// Verdict returned by a judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub passed: bool,
    pub reason: String,
    #[serde(default)]
    pub failure_category: String,
    #[serde(skip)]
    pub usage: Option<TokenUsage>,
}

/// A semantic evaluator of agent output.
#[async_trait]
pub trait LlmJudge: Send + Sync {
    async fn evaluate_text(
        &self,
        cancel: &CancellationToken,
        criteria: &JudgeCriteria,
        prompt: &str,
        output: &str,
    ) -> Result<JudgeResult, JudgeError>;

    fn model_name(&self) -> &str;
}

/// Names of the environment variables holding the judge settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeEnvConfig {
    #[serde(default)]
    pub type_key: String,
    #[serde(default)]
    pub base_url_key: String,
    #[serde(default)]
    pub api_key_key: String,
    #[serde(default)]
    pub model_name_key: String,
}

/// `config.llmJudge` section of an eval document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub env: Option<JudgeEnvConfig>,
}

/// The available judge implementations.
#[derive(Debug)]
pub enum JudgeBackend {
    /// Always passes. Used when no judge is configured.
    Noop,
    OpenAi(OpenAiJudge),
    ClaudeCli(ClaudeCliJudge),
}

#[async_trait]
impl LlmJudge for JudgeBackend {
    async fn evaluate_text(
        &self,
        cancel: &CancellationToken,
        criteria: &JudgeCriteria,
        prompt: &str,
        output: &str,
    ) -> Result<JudgeResult, JudgeError> {
        match self {
            JudgeBackend::Noop => Ok(JudgeResult {
                passed: true,
                reason: "noop judge always passes".to_string(),
                failure_category: "n/a".to_string(),
                usage: None,
            }),
            JudgeBackend::OpenAi(judge) => judge.evaluate_text(cancel, criteria, prompt, output).await,
            JudgeBackend::ClaudeCli(judge) => {
                judge.evaluate_text(cancel, criteria, prompt, output).await
            }
        }
    }

    fn model_name(&self) -> &str {
        match self {
            JudgeBackend::Noop => "noop",
            JudgeBackend::OpenAi(judge) => judge.model_name(),
            JudgeBackend::ClaudeCli(judge) => judge.model_name(),
        }
    }
}

/// Builds the judge for a run from the process environment.
pub fn create_judge(cfg: Option<&JudgeConfig>) -> Result<JudgeBackend, JudgeError> {
    create_judge_with_env(cfg, |key| std::env::var(key).ok())
}

/// Same as [`create_judge`] with an explicit environment lookup.
pub fn create_judge_with_env(
    cfg: Option<&JudgeConfig>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<JudgeBackend, JudgeError> {
    let Some(cfg) = cfg else {
        return Ok(JudgeBackend::Noop);
    };
    let env = cfg.env.as_ref().ok_or(JudgeError::MissingEnvConfig)?;

    let read = |key: &str| {
        if key.is_empty() {
            None
        } else {
            lookup(key).filter(|v| !v.is_empty())
        }
    };

    let judge_type = read(&env.type_key).unwrap_or_else(|| JUDGE_TYPE_OPENAI.to_string());
    let api_key = read(&env.api_key_key);
    let model = read(&env.model_name_key);

    let mut missing = Vec::new();
    if api_key.is_none() {
        missing.push(format!("{} (API key)", env.api_key_key));
    }
    if model.is_none() {
        missing.push(format!("{} (model name)", env.model_name_key));
    }
    let (Some(api_key), Some(model)) = (api_key, model) else {
        return Err(JudgeError::MissingEnv(missing));
    };

    match judge_type.as_str() {
        JUDGE_TYPE_OPENAI => {
            let base_url = read(&env.base_url_key).ok_or_else(|| {
                JudgeError::MissingEnv(vec![format!("{} (base URL)", env.base_url_key)])
            })?;
            Ok(JudgeBackend::OpenAi(OpenAiJudge::new(base_url, api_key, model)?))
        }
        JUDGE_TYPE_CLAUDE => {
            if find_in_path("claude").is_none() {
                return Err(JudgeError::ClaudeNotFound);
            }
            Ok(JudgeBackend::ClaudeCli(ClaudeCliJudge::new()))
        }
        other => Err(JudgeError::UnsupportedType(other.to_string())),
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// System prompt shared by all backends.
pub(crate) fn system_prompt(criteria: &JudgeCriteria) -> String {
    let mode_rules = match criteria.evaluation_mode() {
        EvaluationMode::Exact => {
            "The response passes only if it is semantically equivalent to the reference answer. \
             Extra or missing information is a failure."
        }
        EvaluationMode::Contains => {
            "The response passes if it contains all of the information in the reference answer. \
             Additional information is allowed."
        }
    };

    format!(
        "You are an impartial judge evaluating the response of an AI assistant.\n\
         Evaluation mode: {mode}\n\
         {mode_rules}\n\n\
         Reference answer:\n{reference}\n\n\
         Judge semantics, not formatting. Report the verdict through the submit_judgement tool \
         with a failureCategory of semantic_mismatch, missing_information, contains_extra_info, \
         or n/a when passing.",
        mode = criteria.evaluation_mode(),
        reference = criteria.reference_answer(),
    )
}

pub(crate) fn user_prompt(prompt: &str, output: &str) -> String {
    format!(
        "[USER PROMPT]\n{}\n[END USER PROMPT]\n\n[MODEL RESPONSE]\n{}\n[END MODEL RESPONSE]",
        prompt, output
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_config() -> JudgeConfig {
        JudgeConfig {
            env: Some(JudgeEnvConfig {
                type_key: "JUDGE_TYPE".into(),
                base_url_key: "JUDGE_BASE_URL".into(),
                api_key_key: "JUDGE_API_KEY".into(),
                model_name_key: "JUDGE_MODEL".into(),
            }),
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_criteria_validation() {
        assert!(JudgeCriteria::default().validate().is_err());
        let both = JudgeCriteria {
            contains: "a".into(),
            exact: "b".into(),
        };
        assert_eq!(
            both.validate().unwrap_err().to_string(),
            "only one of contains or exact can be specified, not both"
        );

        let exact = JudgeCriteria {
            contains: String::new(),
            exact: "42".into(),
        };
        assert!(exact.validate().is_ok());
        assert_eq!(exact.evaluation_mode(), EvaluationMode::Exact);
        assert_eq!(exact.reference_answer(), "42");
    }

    #[test]
    fn test_no_config_is_noop() {
        let judge = create_judge_with_env(None, lookup(&[])).unwrap();
        assert_eq!(judge.model_name(), "noop");
    }

    #[tokio::test]
    async fn test_noop_always_passes() {
        let judge = JudgeBackend::Noop;
        let result = judge
            .evaluate_text(
                &CancellationToken::new(),
                &JudgeCriteria::default(),
                "p",
                "o",
            )
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.reason, "noop judge always passes");
    }

    #[test]
    fn test_missing_env_vars_listed() {
        let err = create_judge_with_env(Some(&env_config()), lookup(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("JUDGE_API_KEY (API key)"));
        assert!(msg.contains("JUDGE_MODEL (model name)"));
    }

    #[test]
    fn test_missing_env_section() {
        let err = create_judge_with_env(Some(&JudgeConfig::default()), lookup(&[])).unwrap_err();
        assert!(matches!(err, JudgeError::MissingEnvConfig));
    }

    #[test]
    fn test_unsupported_type() {
        let err = create_judge_with_env(
            Some(&env_config()),
            lookup(&[
                ("JUDGE_TYPE", "gemini"),
                ("JUDGE_API_KEY", "k"),
                ("JUDGE_MODEL", "m"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedType(t) if t == "gemini"));
    }

    #[test]
    fn test_openai_is_default_type() {
        let judge = create_judge_with_env(
            Some(&env_config()),
            lookup(&[
                ("JUDGE_BASE_URL", "http://localhost:1"),
                ("JUDGE_API_KEY", "k"),
                ("JUDGE_MODEL", "gpt-test"),
            ]),
        )
        .unwrap();
        assert!(matches!(judge, JudgeBackend::OpenAi(_)));
        assert_eq!(judge.model_name(), "gpt-test");
    }

    #[test]
    fn test_openai_requires_base_url() {
        let err = create_judge_with_env(
            Some(&env_config()),
            lookup(&[("JUDGE_API_KEY", "k"), ("JUDGE_MODEL", "m")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("JUDGE_BASE_URL (base URL)"));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::default();
        assert!(usage.is_zero());
        usage.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        usage.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
        });
        assert_eq!(usage.total(), 17);
    }
}
