//! Runs the tasks of an eval with bounded parallelism.

use std::sync::Arc;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assertions::CompositeAssertionResult;
use super::config::EvalSpec;
use super::discovery::{discover_tasks, DiscoveredTask};
use super::progress::{NoopProgress, ProgressCallback, ProgressEvent, ProgressEventType};
use super::EvalError;
use crate::agent::{AgentRunner, TokenEstimate};
use crate::extension::ExtensionManager;
use crate::judge::{create_judge, LlmJudge, TokenUsage};
use crate::mcp::{CallHistory, McpServerManager, TaskMcp};
use crate::steps::llm_judge::LlmJudgeStep;
use crate::steps::Registry;
use crate::task::{PhaseOutput, TaskDeps, TaskRunner};

/// Outcome of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResult {
    pub task_name: String,
    pub task_path: String,
    pub task_passed: bool,
    pub task_output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_judge_reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_judge_error: String,
    /// The agent itself failed, as opposed to producing a wrong answer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub agent_execution_error: bool,
    pub difficulty: String,
    pub assertion_results: Option<CompositeAssertionResult>,
    pub all_assertions_passed: bool,
    pub call_history: Option<CallHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<TokenEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_output: Option<PhaseOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_output: Option<PhaseOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_output: Option<PhaseOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_output: Option<PhaseOutput>,
}

/// `taskError` of tasks skipped because the run was cancelled.
pub const CANCELLED: &str = "cancelled";

/// Collaborators shared by every task of a run.
struct Shared<'a> {
    registry: Registry,
    extensions: Arc<ExtensionManager>,
    mcp_servers: McpServerManager,
    agent: Arc<dyn AgentRunner>,
    progress: &'a dyn ProgressCallback,
}

impl Shared<'_> {
    fn deps(&self) -> TaskDeps<'_> {
        TaskDeps {
            registry: &self.registry,
            extensions: &self.extensions,
            mcp_servers: &self.mcp_servers,
        }
    }

    fn emit(&self, event_type: ProgressEventType, message: String, task: &EvalResult) {
        self.progress
            .on_event(&ProgressEvent::for_task(event_type, message, task));
    }
}

/// Discovers the tasks of an [`EvalSpec`] and runs them.
///
/// The agent runner, judge, MCP servers and extensions are created once per
/// run and shared by all tasks. Results come back in discovery order.
pub struct EvalRunner {
    spec: EvalSpec,
    parallelism: usize,
    agent: Option<Arc<dyn AgentRunner>>,
    judge: Option<Arc<dyn LlmJudge>>,
}

impl EvalRunner {
    /// Runs tasks one at a time.
    pub fn new(spec: EvalSpec) -> Self {
        Self {
            spec,
            parallelism: 1,
            agent: None,
            judge: None,
        }
    }

    /// Sets how many tasks may run at once. Zero means one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses `agent` instead of building one from `config.agent`.
    pub fn with_agent(mut self, agent: Arc<dyn AgentRunner>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Uses `judge` instead of building one from `config.llmJudge`.
    pub fn with_judge(mut self, judge: Arc<dyn LlmJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        task_pattern: &str,
    ) -> Result<Vec<EvalResult>, EvalError> {
        self.run_with_progress(cancel, task_pattern, &NoopProgress)
            .await
    }

    pub async fn run_with_progress(
        &self,
        cancel: &CancellationToken,
        task_pattern: &str,
        progress: &dyn ProgressCallback,
    ) -> Result<Vec<EvalResult>, EvalError> {
        let pattern = if task_pattern.is_empty() { "." } else { task_pattern };
        let matcher = Regex::new(pattern).map_err(EvalError::InvalidPattern)?;

        let tasks = discover_tasks(&self.spec, &matcher)?;
        info!(
            eval = %self.spec.name(),
            tasks = tasks.len(),
            parallelism = self.parallelism,
            "Starting evaluation"
        );
        progress.on_event(
            &ProgressEvent::new(ProgressEventType::EvalStart, "Starting evaluation")
                .with_total_tasks(tasks.len()),
        );

        let shared = self.build_shared(progress)?;

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let futures = tasks.iter().map(|task| {
            let sem = semaphore.clone();
            let shared = &shared;
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled_task(shared, task),
                    permit = sem.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return cancelled_task(shared, task),
                    },
                };
                run_task(cancel, shared, task).await
            }
        });
        // join_all keeps input order, so results line up with discovery
        // order whatever the completion order. Tasks that never started
        // still get a result, so a cancelled run keeps what finished.
        let results = join_all(futures).await;

        if let Err(e) = shared.extensions.shutdown_all(cancel).await {
            warn!(error = %e, "Failed to shut down extensions");
        }

        progress.on_event(&ProgressEvent::new(
            ProgressEventType::EvalComplete,
            "Evaluation complete",
        ));

        Ok(results)
    }

    fn build_shared<'a>(&self, progress: &'a dyn ProgressCallback) -> Result<Shared<'a>, EvalError> {
        let config = &self.spec.config;
        progress.on_event(
            &ProgressEvent::new(ProgressEventType::SetupStart, "Preparing evaluation")
                .with_total_steps(4),
        );
        let step = |message: &str| {
            progress.on_event(&ProgressEvent::new(ProgressEventType::SetupStep, message));
        };

        let mcp_servers =
            McpServerManager::new(config.mcp_servers.clone()).map_err(EvalError::Mcp)?;
        step("Loaded MCP servers");

        let agent = match (&self.agent, &config.agent) {
            (Some(agent), _) => agent.clone(),
            (None, Some(spec)) => spec.build().map_err(EvalError::Agent)?,
            (None, None) => return Err(EvalError::MissingAgent),
        };
        step("Created agent runner");

        let judge: Arc<dyn LlmJudge> = match &self.judge {
            Some(judge) => judge.clone(),
            None => Arc::new(create_judge(config.llm_judge.as_ref()).map_err(EvalError::Judge)?),
        };
        debug!(judge = %judge.model_name(), "Created llm judge");
        step("Created llm judge");

        let mut extensions = ExtensionManager::new(self.spec.base_path());
        for (alias, reference) in &config.extensions {
            extensions
                .register(alias, reference.clone())
                .map_err(|source| EvalError::RegisterExtension {
                    alias: alias.clone(),
                    source,
                })?;
        }
        step("Registered extensions");

        progress.on_event(&ProgressEvent::new(
            ProgressEventType::SetupComplete,
            "Evaluation ready",
        ));

        Ok(Shared {
            registry: Registry::builtin(judge),
            extensions: Arc::new(extensions),
            mcp_servers,
            agent,
            progress,
        })
    }
}

/// Result of a task that was cancelled before it got a slot.
fn cancelled_task(shared: &Shared<'_>, task: &DiscoveredTask) -> EvalResult {
    let result = EvalResult {
        task_name: task.config.name().to_string(),
        task_path: task.path.display().to_string(),
        difficulty: task.config.metadata.difficulty.clone(),
        task_error: CANCELLED.to_string(),
        ..Default::default()
    };
    shared.emit(
        ProgressEventType::TaskError,
        format!("Task cancelled: {}", result.task_name),
        &result,
    );
    result
}

async fn run_task(cancel: &CancellationToken, shared: &Shared<'_>, task: &DiscoveredTask) -> EvalResult {
    let name = task.config.name().to_string();
    let mut result = EvalResult {
        task_name: name.clone(),
        task_path: task.path.display().to_string(),
        difficulty: task.config.metadata.difficulty.clone(),
        ..Default::default()
    };

    shared.emit(ProgressEventType::TaskStart, format!("Starting task: {}", name), &result);
    shared.emit(ProgressEventType::TaskSetup, format!("Setting up task: {}", name), &result);

    let mut runner = match TaskRunner::new(cancel, &task.config, shared.deps()).await {
        Ok(runner) => runner,
        Err(e) => {
            result.task_error = format!("failed to create task runner for task '{}': {}", name, e);
            shared.emit(ProgressEventType::TaskError, format!("Task setup failed: {}", name), &result);
            return result;
        }
    };

    let mcp = TaskMcp::new(&shared.mcp_servers);

    match runner.setup(cancel).await {
        Ok(output) => result.setup_output = Some(output),
        Err(e) => {
            result.setup_output = Some(e.output);
            result.task_error = format!("failed to setup task: {}", e.source);
            // Undo whatever the steps before the failing one created.
            result.cleanup_output = Some(run_cleanup(cancel, &mut runner, &name).await);
            shared.emit(ProgressEventType::TaskError, format!("Task setup failed: {}", name), &result);
            return result;
        }
    }

    execute_task_steps(cancel, shared, &mut runner, &mcp, &mut result).await;

    result.cleanup_output = Some(run_cleanup(cancel, &mut runner, &name).await);

    shared.emit(
        ProgressEventType::TaskAssertions,
        format!("Evaluating assertions for task: {}", name),
        &result,
    );
    let history = mcp.history();
    match &task.assertions {
        Some(assertions) => {
            let evaluated = assertions.evaluate(&history);
            result.all_assertions_passed = evaluated.succeeded();
            result.assertion_results = Some(evaluated);
        }
        None => result.all_assertions_passed = true,
    }
    result.call_history = Some(history);

    info!(task = %name, passed = result.task_passed, assertions_passed = result.all_assertions_passed, "Task finished");
    shared.emit(
        ProgressEventType::TaskComplete,
        format!("Completed task: {} (passed: {})", name, result.task_passed),
        &result,
    );
    result
}

async fn execute_task_steps(
    cancel: &CancellationToken,
    shared: &Shared<'_>,
    runner: &mut TaskRunner,
    mcp: &TaskMcp<'_>,
    result: &mut EvalResult,
) {
    shared.emit(
        ProgressEventType::TaskRunning,
        format!("Running agent for task: {}", result.task_name),
        result,
    );

    match runner.run_agent(cancel, shared.agent.as_ref(), mcp).await {
        Err(e) => {
            result.task_output = agent_output_text(&e.output);
            result.agent_output = Some(e.output);
            result.task_error = e.source.to_string();
            result.agent_execution_error = true;
            return;
        }
        Ok(output) => {
            result.task_output = agent_output_text(&output);
            result.token_estimate = output
                .agent_details
                .as_ref()
                .and_then(|d| d.token_estimate.clone());
            result.agent_output = Some(output);
        }
    }

    shared.emit(
        ProgressEventType::TaskVerifying,
        format!("Verifying task: {}", result.task_name),
        result,
    );

    let (verify, error) = match runner.verify(cancel).await {
        Ok(output) => (output, None),
        Err(e) => (e.output, Some(e.source)),
    };

    let mut judge_usage = TokenUsage::default();
    for step in verify.steps.iter().filter(|s| s.step_type == LlmJudgeStep::TYPE) {
        if let Some(usage) = &step.usage {
            judge_usage.add(usage);
        }
    }
    if !judge_usage.is_zero() {
        result.judge_token_usage = Some(judge_usage);
    }

    match error {
        Some(e) => {
            result.task_passed = false;
            result.task_error = format!("verification failed: {}", e);
        }
        None if !verify.success => {
            result.task_passed = false;
            result.task_error = "one or more verification steps failed".to_string();
        }
        None => result.task_passed = true,
    }

    if let Some(judged) = verify.steps.iter().find(|s| s.step_type == LlmJudgeStep::TYPE) {
        result.task_judge_reason = judged.message.clone();
    }

    result.verify_output = Some(verify);
}

async fn run_cleanup(cancel: &CancellationToken, runner: &mut TaskRunner, name: &str) -> PhaseOutput {
    match runner.cleanup(cancel).await {
        Ok(output) => output,
        Err(e) => {
            warn!(task = %name, error = %e, "Cleanup failed");
            e.output
        }
    }
}

fn agent_output_text(output: &PhaseOutput) -> String {
    output
        .steps
        .first()
        .and_then(|s| s.outputs.get("output"))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallelism_normalized() {
        assert_eq!(EvalRunner::new(EvalSpec::default()).parallelism(), 1);
        assert_eq!(
            EvalRunner::new(EvalSpec::default()).with_parallelism(0).parallelism(),
            1
        );
        assert_eq!(
            EvalRunner::new(EvalSpec::default()).with_parallelism(4).parallelism(),
            4
        );
    }

    #[tokio::test]
    async fn test_missing_agent() {
        let err = EvalRunner::new(EvalSpec::default())
            .run(&CancellationToken::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::MissingAgent));
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let err = EvalRunner::new(EvalSpec::default())
            .run(&CancellationToken::new(), "(")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to compile regexp"));
    }

    #[test]
    fn test_result_json_shape() {
        let result = EvalResult {
            task_name: "t".into(),
            task_passed: true,
            all_assertions_passed: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["taskName"], "t");
        assert!(json.get("taskError").is_none());
        assert!(json.get("agentExecutionError").is_none());
        assert!(json["assertionResults"].is_null());
    }
}
