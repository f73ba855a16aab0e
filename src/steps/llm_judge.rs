//! `llmJudge` step: asks the configured judge whether the agent's answer
//! contains (or exactly matches) a reference answer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::template::{Sources, StepOutputResolver, Template, SOURCE_RANDOM, SOURCE_STEPS};
use super::{StepError, StepInput, StepOutput, StepRunner};
use crate::judge::{JudgeCriteria, LlmJudge};

const ALLOWED_SOURCES: &[&str] = &[SOURCE_RANDOM, SOURCE_STEPS];

pub struct LlmJudgeStep {
    contains: Option<Template>,
    exact: Option<Template>,
    judge: Arc<dyn LlmJudge>,
}

impl fmt::Debug for LlmJudgeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmJudgeStep")
            .field("contains", &self.contains)
            .field("exact", &self.exact)
            .field("judge", &self.judge.model_name())
            .finish()
    }
}

impl LlmJudgeStep {
    pub const TYPE: &'static str = "llmJudge";

    pub fn parse(raw: &Value, judge: Arc<dyn LlmJudge>) -> Result<Self, StepError> {
        let criteria: JudgeCriteria =
            serde_json::from_value(raw.clone()).map_err(|source| StepError::Parse {
                step_type: Self::TYPE.to_string(),
                source,
            })?;
        criteria
            .validate()
            .map_err(|e| StepError::InvalidConfig(e.to_string()))?;

        let parse = |text: &str| -> Result<Option<Template>, StepError> {
            if text.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Template::parse(text, ALLOWED_SOURCES)?))
            }
        };

        Ok(Self {
            contains: parse(&criteria.contains)?,
            exact: parse(&criteria.exact)?,
            judge,
        })
    }
}

#[async_trait]
impl StepRunner for LlmJudgeStep {
    fn step_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, input: &StepInput<'_>) -> Result<StepOutput, StepError> {
        let agent = input
            .agent
            .filter(|a| !a.prompt.is_empty() && !a.output.is_empty())
            .ok_or(StepError::MissingAgentContext)?;

        let steps = StepOutputResolver::new(input.step_outputs);
        let sources = Sources::new()
            .with(SOURCE_RANDOM, input.random)
            .with(SOURCE_STEPS, &steps);

        let mut criteria = JudgeCriteria::default();
        if let Some(tpl) = &self.contains {
            criteria.contains = tpl.render(&sources).map_err(|source| StepError::Resolve {
                field: "contains",
                source,
            })?;
        }
        if let Some(tpl) = &self.exact {
            criteria.exact = tpl.render(&sources).map_err(|source| StepError::Resolve {
                field: "exact",
                source,
            })?;
        }

        info!(model = %self.judge.model_name(), mode = %criteria.evaluation_mode(), "LLM judge is evaluating");
        debug!(reference = %criteria.reference_answer(), "Resolved judge reference answer");

        let verdict = self
            .judge
            .evaluate_text(input.cancel, &criteria, &agent.prompt, &agent.output)
            .await?;

        let mut out = StepOutput {
            step_type: Self::TYPE.to_string(),
            success: verdict.passed,
            message: verdict.reason.clone(),
            usage: verdict.usage,
            ..Default::default()
        };
        if !verdict.passed {
            out.error = format!(
                "llm judge failed for reason '{}': {}",
                verdict.failure_category, verdict.reason
            );
        }
        Ok(out)
    }
}
