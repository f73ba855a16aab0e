//! Executes one task: setup, agent, verify, cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TaskConfig;
use crate::agent::{AgentError, AgentRunner, TokenEstimate, ToolCallSummary};
use crate::error::{ConfigError, ErrorList};
use crate::extension::ExtensionManager;
use crate::mcp::{McpServerInfo, McpServerManager};
use crate::steps::template::{Sources, SOURCE_STEPS};
use crate::steps::{
    AgentContext, RandomResolver, Registry, StepError, StepInput, StepOutput, StepOutputResolver,
    StepOutputs, StepRunner, Template,
};

/// Type of the synthetic step recorded for the agent phase.
pub const AGENT_STEP_TYPE: &str = "agent";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("prompt.inline or prompt.file must be set on a task to run it")]
    MissingPrompt,

    #[error("{0}")]
    Requirement(String),

    #[error("failed to parse task steps: {0}")]
    Parse(ErrorList<StepParseError>),

    #[error("failed to get prompt for task: {0}")]
    Prompt(#[source] ConfigError),

    #[error("{phase}[{index}] failed: {source}")]
    Step {
        phase: &'static str,
        index: usize,
        #[source]
        source: StepError,
    },

    #[error("failed to run agent: {0}")]
    Agent(#[source] AgentError),
}

/// A step that failed to parse, with its position.
#[derive(Debug, Error)]
#[error("failed to parse {phase}[{index}]: {source}")]
pub struct StepParseError {
    pub phase: &'static str,
    pub index: usize,
    #[source]
    pub source: StepError,
}

/// A phase that ended with an error, along with what it produced up to then.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PhaseError {
    pub output: PhaseOutput,
    #[source]
    pub source: TaskError,
}

/// Structured information from the agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<TokenEstimate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub final_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
}

/// What one phase produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseOutput {
    /// One entry per executed step. The agent phase has a single synthetic
    /// entry.
    pub steps: Vec<StepOutput>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_details: Option<AgentDetails>,
}

impl PhaseOutput {
    fn new() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}

/// Run-wide collaborators a task is built against.
#[derive(Clone, Copy)]
pub struct TaskDeps<'a> {
    pub registry: &'a Registry,
    pub extensions: &'a Arc<ExtensionManager>,
    pub mcp_servers: &'a McpServerManager,
}

/// Runs the phases of one task.
///
/// Steps are parsed up front, so a bad step config fails the task before any
/// phase runs. Values generated by `{random.*}` are shared by all phases.
pub struct TaskRunner {
    name: String,
    setup: Vec<Box<dyn StepRunner>>,
    verify: Vec<Box<dyn StepRunner>>,
    cleanup: Vec<Box<dyn StepRunner>>,
    prompt: String,
    output: String,
    base_dir: PathBuf,
    env: HashMap<String, String>,
    setup_outputs: StepOutputs,
    random: RandomResolver,
}

impl TaskRunner {
    pub async fn new(
        cancel: &CancellationToken,
        cfg: &TaskConfig,
        deps: TaskDeps<'_>,
    ) -> Result<Self, TaskError> {
        let prompt_source = cfg
            .spec
            .prompt
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or(TaskError::MissingPrompt)?;

        let (extensions, mcp_servers) = resolve_requirements(cfg, deps)?;

        let registry = deps
            .registry
            .clone()
            .with_extensions(deps.extensions, &extensions)
            .with_mcp_servers(mcp_servers.keys());

        let mut errors = ErrorList::new();
        let setup = parse_phase(cancel, &registry, "setup", &cfg.spec.setup, &mut errors).await;
        let verify = parse_phase(cancel, &registry, "verify", &cfg.spec.verify, &mut errors).await;
        let cleanup =
            parse_phase(cancel, &registry, "cleanup", &cfg.spec.cleanup, &mut errors).await;
        errors.into_result().map_err(TaskError::Parse)?;

        let prompt = prompt_source.value().map_err(TaskError::Prompt)?;

        Ok(Self {
            name: cfg.name().to_string(),
            setup,
            verify,
            cleanup,
            prompt,
            output: String::new(),
            base_dir: cfg.base_path.clone(),
            env: cfg.spec.env.clone(),
            setup_outputs: StepOutputs::new(),
            random: RandomResolver::new(),
        })
    }

    /// The prompt as sent to the agent (after template resolution once the
    /// agent ran).
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The agent's output. Empty until the agent ran.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub async fn setup(&mut self, cancel: &CancellationToken) -> Result<PhaseOutput, PhaseError> {
        let (output, outputs, error) = self
            .run_phase(cancel, "setup", &self.setup, StepOutputs::new(), None)
            .await;
        // Kept even on failure so cleanup can undo what did get created.
        self.setup_outputs = outputs;
        finish(output, error)
    }

    /// Runs cleanup steps, seeded with the outputs setup produced.
    pub async fn cleanup(&mut self, cancel: &CancellationToken) -> Result<PhaseOutput, PhaseError> {
        let seed = self.setup_outputs.clone();
        let (output, _, error) = self
            .run_phase(cancel, "cleanup", &self.cleanup, seed, None)
            .await;
        finish(output, error)
    }

    pub async fn run_agent(
        &mut self,
        cancel: &CancellationToken,
        agent: &dyn AgentRunner,
        mcp: &dyn McpServerInfo,
    ) -> Result<PhaseOutput, PhaseError> {
        self.prompt = self.resolve_prompt_templates();
        info!(task = %self.name, agent = %agent.name(), "Running agent");

        match agent.run_task(cancel, &self.prompt, mcp).await {
            Err(e) => {
                let raw = e.to_string();
                let err = TaskError::Agent(e);
                let message = err.to_string();
                let output = PhaseOutput {
                    steps: vec![StepOutput::failure(AGENT_STEP_TYPE, message.clone())
                        .with_outputs(HashMap::from([("output".to_string(), raw)]))],
                    success: false,
                    error: message,
                    agent_details: None,
                };
                Err(PhaseError { output, source: err })
            }
            Ok(result) => {
                self.output = result.output.clone();
                let details = AgentDetails {
                    token_estimate: Some(result.token_estimate),
                    tool_calls: result.tool_calls,
                    final_message: result.final_message,
                    thinking: result.thinking,
                };
                Ok(PhaseOutput {
                    steps: vec![StepOutput::success(AGENT_STEP_TYPE, result.output.clone())
                        .with_outputs(HashMap::from([("output".to_string(), result.output)]))],
                    success: true,
                    error: String::new(),
                    agent_details: Some(details),
                })
            }
        }
    }

    /// Runs verify steps with the prompt and agent output as context.
    pub async fn verify(&mut self, cancel: &CancellationToken) -> Result<PhaseOutput, PhaseError> {
        let agent = AgentContext {
            prompt: self.prompt.clone(),
            output: self.output.clone(),
        };
        let (output, _, error) = self
            .run_phase(cancel, "verify", &self.verify, StepOutputs::new(), Some(&agent))
            .await;
        finish(output, error)
    }

    /// Substitutes `{steps.*}` in the prompt with setup outputs. Anything
    /// that does not resolve leaves the prompt as it was.
    fn resolve_prompt_templates(&self) -> String {
        if self.setup_outputs.is_empty() || !self.prompt.contains("{steps.") {
            return self.prompt.clone();
        }
        let Ok(tpl) = Template::parse(&self.prompt, &[SOURCE_STEPS]) else {
            return self.prompt.clone();
        };
        let resolver = StepOutputResolver::new(&self.setup_outputs);
        let sources = Sources::new().with(SOURCE_STEPS, &resolver);
        match tpl.render(&sources) {
            Ok(prompt) => prompt,
            Err(e) => {
                debug!(task = %self.name, error = %e, "Leaving prompt templates unresolved");
                self.prompt.clone()
            }
        }
    }

    async fn run_phase(
        &self,
        cancel: &CancellationToken,
        phase: &'static str,
        runners: &[Box<dyn StepRunner>],
        mut outputs: StepOutputs,
        agent: Option<&AgentContext>,
    ) -> (PhaseOutput, StepOutputs, Option<TaskError>) {
        let mut out = PhaseOutput::new();

        for (index, runner) in runners.iter().enumerate() {
            debug!(task = %self.name, phase, index, step_type = %runner.step_type(), "Executing step");
            let input = StepInput {
                cancel,
                workdir: &self.base_dir,
                env: &self.env,
                agent,
                step_outputs: &outputs,
                random: &self.random,
            };

            let res = match runner.execute(&input).await {
                Ok(res) => res,
                Err(source) => {
                    warn!(task = %self.name, phase, index, error = %source, "Step failed to run");
                    out.steps
                        .push(StepOutput::failure(runner.step_type(), source.to_string()));
                    out.success = false;
                    out.error = source.to_string();
                    let err = TaskError::Step {
                        phase,
                        index,
                        source,
                    };
                    return (out, outputs, Some(err));
                }
            };

            if !res.success {
                out.success = false;
            }
            if res.success && !res.outputs.is_empty() && !res.step_type.is_empty() {
                outputs.insert(res.step_type.clone(), res.outputs.clone());
            }
            out.steps.push(res);
        }

        (out, outputs, None)
    }
}

fn finish(output: PhaseOutput, error: Option<TaskError>) -> Result<PhaseOutput, PhaseError> {
    match error {
        None => Ok(output),
        Some(source) => Err(PhaseError { output, source }),
    }
}

async fn parse_phase(
    cancel: &CancellationToken,
    registry: &Registry,
    phase: &'static str,
    configs: &[crate::steps::StepConfig],
    errors: &mut ErrorList<StepParseError>,
) -> Vec<Box<dyn StepRunner>> {
    let mut runners = Vec::with_capacity(configs.len());
    for (index, cfg) in configs.iter().enumerate() {
        let cfg = if cfg.id.is_empty() {
            cfg.clone().with_id(format!("{}_{}", phase, index))
        } else {
            cfg.clone()
        };
        let parsed = registry.parse(cancel, &cfg).await.map_err(|source| StepParseError {
            phase,
            index,
            source,
        });
        if let Some(runner) = errors.collect(parsed) {
            runners.push(runner);
        }
    }
    runners
}

type AliasMap = HashMap<String, String>;

/// Checks `spec.requires` and returns the extension and MCP server alias
/// tables (alias to registered name).
fn resolve_requirements(
    cfg: &TaskConfig,
    deps: TaskDeps<'_>,
) -> Result<(AliasMap, AliasMap), TaskError> {
    let mut extensions = AliasMap::new();
    let mut mcp_servers = AliasMap::new();

    let check_alias = |alias: &str, extensions: &AliasMap, mcp_servers: &AliasMap| {
        if extensions.contains_key(alias) || mcp_servers.contains_key(alias) {
            return Err(TaskError::Requirement(format!(
                "duplicate alias {:?} in requirements",
                alias
            )));
        }
        if alias.contains('.') {
            return Err(TaskError::Requirement(format!(
                "alias {:?} cannot contain dots",
                alias
            )));
        }
        Ok(())
    };

    for (i, req) in cfg.spec.requires.iter().enumerate() {
        match (&req.extension, &req.mcp_server) {
            (Some(_), Some(_)) => {
                return Err(TaskError::Requirement(format!(
                    "task.spec.requires[{}] is invalid: must have only one of mcpserver or extension defined, has both",
                    i
                )))
            }
            (Some(ext), None) => {
                if !deps.extensions.has(ext) {
                    return Err(TaskError::Requirement(format!(
                        "required extension {:?} not registered",
                        ext
                    )));
                }
                let alias = req.alias.clone().unwrap_or_else(|| ext.clone());
                check_alias(&alias, &extensions, &mcp_servers)?;
                extensions.insert(alias, ext.clone());
            }
            (None, Some(server)) => {
                if deps.mcp_servers.get(server).is_none() {
                    return Err(TaskError::Requirement(format!(
                        "required mcpServer {:?} not registered",
                        server
                    )));
                }
                let alias = req.alias.clone().unwrap_or_else(|| server.clone());
                check_alias(&alias, &extensions, &mcp_servers)?;
                mcp_servers.insert(alias, server.clone());
            }
            (None, None) => {}
        }
    }

    Ok((extensions, mcp_servers))
}
