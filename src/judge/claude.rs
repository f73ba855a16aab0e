//! Judge that shells out to the `claude` CLI in print mode.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{system_prompt, user_prompt, JudgeCriteria, JudgeError, JudgeResult, LlmJudge};

const MODEL_NAME: &str = "claude-code-cli";

#[derive(Debug, Default)]
pub struct ClaudeCliJudge {
    binary: String,
}

impl ClaudeCliJudge {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }

    fn full_prompt(criteria: &JudgeCriteria, prompt: &str, output: &str) -> String {
        format!(
            "{}\n\n{}\n\nPlease respond with ONLY a JSON object in the following format (no other text):\n\
             {{\n  \"passed\": true or false,\n  \"reason\": \"detailed explanation\",\n  \
             \"failureCategory\": \"semantic_mismatch\" or \"missing_information\" or \"contains_extra_info\" or \"n/a\"\n}}",
            system_prompt(criteria),
            user_prompt(prompt, output)
        )
    }
}

/// Pulls the outermost `{...}` out of free-form CLI output.
fn extract_verdict(text: &str) -> Result<JudgeResult, JudgeError> {
    let text = text.trim();
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(JudgeError::Parse(format!(
            "no valid JSON found in Claude response: {}",
            text
        )));
    };
    if end < start {
        return Err(JudgeError::Parse(format!(
            "no valid JSON found in Claude response: {}",
            text
        )));
    }

    let json = &text[start..=end];
    serde_json::from_str(json).map_err(|e| {
        JudgeError::Parse(format!(
            "failed to unmarshal Claude response as JSON: {}\nResponse: {}",
            e, json
        ))
    })
}

#[async_trait]
impl LlmJudge for ClaudeCliJudge {
    async fn evaluate_text(
        &self,
        cancel: &CancellationToken,
        criteria: &JudgeCriteria,
        prompt: &str,
        output: &str,
    ) -> Result<JudgeResult, JudgeError> {
        let full_prompt = Self::full_prompt(criteria, prompt, output);
        debug!(binary = %self.binary, "Running claude judge");

        let run = Command::new(&self.binary)
            .arg("--print")
            .arg(&full_prompt)
            .kill_on_drop(true)
            .output();

        let out = tokio::select! {
            res = run => res.map_err(|e| JudgeError::Request(format!("failed to execute claude CLI: {}", e)))?,
            _ = cancel.cancelled() => return Err(JudgeError::Cancelled),
        };

        let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));

        if !out.status.success() {
            return Err(JudgeError::Request(format!(
                "failed to execute claude CLI: {}\nOutput: {}",
                out.status, combined
            )));
        }

        extract_verdict(&combined)
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_verdict_with_surrounding_text() {
        let text = "Sure, here it is:\n{\"passed\": true, \"reason\": \"matches\", \"failureCategory\": \"n/a\"}\nDone.";
        let verdict = extract_verdict(text).unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.reason, "matches");
    }

    #[test]
    fn test_extract_verdict_without_json() {
        assert!(extract_verdict("no braces here").is_err());
        assert!(extract_verdict("} backwards {").is_err());
    }

    #[test]
    fn test_prompt_mentions_format() {
        let criteria = JudgeCriteria {
            contains: String::new(),
            exact: "42".into(),
        };
        let prompt = ClaudeCliJudge::full_prompt(&criteria, "what is 6*7", "42");
        assert!(prompt.contains("EXACT"));
        assert!(prompt.contains("\"failureCategory\""));
        assert_eq!(ClaudeCliJudge::new().model_name(), "claude-code-cli");
    }
}
