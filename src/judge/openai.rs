//! Judge backed by an OpenAI-compatible chat completions endpoint.
//!
//! The model is forced to answer through a single `submit_judgement`
//! function call, whose arguments are the verdict.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{system_prompt, user_prompt, JudgeCriteria, JudgeError, JudgeResult, LlmJudge, TokenUsage};

const SUBMIT_JUDGEMENT: &str = "submit_judgement";
const SEED: u64 = 0;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Gemini's OpenAI-compatible endpoint rejects the `seed` field.
const NO_SEED_HOST: &str = "generativelanguage.googleapis.com";

/// Chat completions judge.
pub struct OpenAiJudge {
    http_client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for OpenAiJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiJudge")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ChatMessage>,
    tools: Vec<Value>,
    tool_choice: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    function: ApiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn submit_judgement_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SUBMIT_JUDGEMENT,
            "description": "",
            "parameters": {
                "type": "object",
                "properties": {
                    "passed": {
                        "type": "boolean",
                        "description": "Binary result: true for pass, false for fail"
                    },
                    "reason": {
                        "type": "string",
                        "description": "A detailed explanation for the score, referencing the evaluation criterion and the text"
                    },
                    "failureCategory": {
                        "type": "string",
                        "description": "If passed is false, specify the reason. Use 'n/a' if passing",
                        "enum": ["semantic_mismatch", "missing_information", "contains_extra_info", "n/a"]
                    }
                },
                "required": ["passed", "reason", "failureCategory"]
            }
        }
    })
}

impl OpenAiJudge {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, JudgeError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| JudgeError::Request(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn supports_seed(&self) -> bool {
        !self.base_url.contains(NO_SEED_HOST)
    }

    fn build_request(&self, criteria: &JudgeCriteria, prompt: &str, output: &str) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(criteria),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt(prompt, output),
                },
            ],
            tools: vec![submit_judgement_tool()],
            tool_choice: json!({"type": "function", "function": {"name": SUBMIT_JUDGEMENT}}),
            seed: self.supports_seed().then_some(SEED),
        }
    }

    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, JudgeError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| JudgeError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(JudgeError::Api {
                code: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| JudgeError::Parse(format!("failed to parse API response: {}", e)))
    }
}

/// Extracts the verdict from a completion.
fn parse_verdict(response: ApiResponse) -> Result<JudgeResult, JudgeError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| JudgeError::Parse("no completion choices returned from LLM".to_string()))?;

    let mut calls = choice.message.tool_calls;
    if calls.len() != 1 {
        return Err(JudgeError::Parse(format!(
            "failed to call the correct number of tools, expected 1 call, got {}",
            calls.len()
        )));
    }
    let call = calls.remove(0);

    if call.function.name != SUBMIT_JUDGEMENT {
        return Err(JudgeError::Parse(format!(
            "llm judge failed to call '{}' tool, called '{}' instead",
            SUBMIT_JUDGEMENT, call.function.name
        )));
    }

    let mut result: JudgeResult = serde_json::from_str(&call.function.arguments).map_err(|e| {
        JudgeError::Parse(format!(
            "failed to unmarshal '{}' tool call arguments: {}",
            SUBMIT_JUDGEMENT, e
        ))
    })?;

    result.usage = response.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(result)
}

#[async_trait]
impl LlmJudge for OpenAiJudge {
    async fn evaluate_text(
        &self,
        cancel: &CancellationToken,
        criteria: &JudgeCriteria,
        prompt: &str,
        output: &str,
    ) -> Result<JudgeResult, JudgeError> {
        let request = self.build_request(criteria, prompt, output);
        debug!(model = %self.model, seed = ?request.seed, "Sending judge request");

        let response = tokio::select! {
            res = self.send(&request) => res?,
            _ = cancel.cancelled() => return Err(JudgeError::Cancelled),
        };

        parse_verdict(response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> JudgeCriteria {
        JudgeCriteria {
            contains: "kind-kind".into(),
            exact: String::new(),
        }
    }

    #[test]
    fn test_seed_omitted_for_gemini() {
        let judge = OpenAiJudge::new(
            "https://generativelanguage.googleapis.com/v1beta/openai/",
            "k",
            "gemini-2.0",
        )
        .unwrap();
        let req = judge.build_request(&criteria(), "p", "o");
        assert!(req.seed.is_none());
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("seed").is_none());
    }

    #[test]
    fn test_request_forces_tool() {
        let judge = OpenAiJudge::new("https://api.openai.com/v1/", "k", "gpt-4o").unwrap();
        let req = judge.build_request(&criteria(), "p", "o");
        assert_eq!(req.seed, Some(0));
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["tool_choice"]["function"]["name"], SUBMIT_JUDGEMENT);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("kind-kind"));
        assert_eq!(judge.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_parse_verdict() {
        let response: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {
                            "name": "submit_judgement",
                            "arguments": "{\"passed\":false,\"reason\":\"wrong context\",\"failureCategory\":\"semantic_mismatch\"}"
                        }
                    }]
                }
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30}
        }))
        .unwrap();

        let verdict = parse_verdict(response).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.failure_category, "semantic_mismatch");
        assert_eq!(verdict.usage.unwrap().total(), 150);
    }

    #[test]
    fn test_parse_verdict_wrong_tool() {
        let response: ApiResponse = serde_json::from_value(json!({
            "choices": [{"message": {"tool_calls": [{"function": {"name": "other", "arguments": "{}"}}]}}]
        }))
        .unwrap();
        let err = parse_verdict(response).unwrap_err();
        assert!(err.to_string().contains("called 'other' instead"));
    }

    #[test]
    fn test_parse_verdict_no_tool_calls() {
        let response: ApiResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": "hi"}}]})).unwrap();
        let err = parse_verdict(response).unwrap_err();
        assert!(err.to_string().contains("expected 1 call, got 0"));
    }
}
