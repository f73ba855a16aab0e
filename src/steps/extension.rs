//! `<alias>.<operation>` steps backed by an extension process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::PrefixParser;
use super::{StepError, StepInput, StepOutput, StepRunner};
use crate::extension::protocol::{AgentInfo, ExecuteContext, ExecuteParams};
use crate::extension::{ExtensionError, ExtensionManager};

/// Upper bound for one operation call.
pub const EXTENSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves operations of one extension alias.
pub struct ExtensionPrefixParser {
    manager: Arc<ExtensionManager>,
    alias: String,
    extension: String,
}

impl ExtensionPrefixParser {
    /// `alias` is the name used in step types; `extension` is the name the
    /// extension is registered under in the manager.
    pub fn new(manager: Arc<ExtensionManager>, alias: String, extension: String) -> Self {
        Self {
            manager,
            alias,
            extension,
        }
    }
}

#[async_trait]
impl PrefixParser for ExtensionPrefixParser {
    async fn parse(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        payload: &Value,
    ) -> Result<Box<dyn StepRunner>, StepError> {
        let client = self
            .manager
            .get(cancel, &self.extension)
            .await
            .map_err(|source| StepError::Extension {
                context: format!("failed to get extension {:?}", self.alias),
                source,
            })?;

        let op = client
            .manifest()
            .operations
            .get(operation)
            .ok_or_else(|| {
                StepError::InvalidConfig(format!(
                    "operation {:?} not declared in extension {:?}",
                    operation, self.alias
                ))
            })?;

        let args = match payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => payload.clone(),
            other => {
                return Err(StepError::InvalidConfig(format!(
                    "failed to parse args: expected an object, got {}",
                    other
                )))
            }
        };

        op.validate_args(&args).map_err(|errors| {
            StepError::InvalidConfig(format!(
                "provided args did not match params for operation {}.{}: {}",
                self.alias,
                operation,
                errors.join("; ")
            ))
        })?;

        Ok(Box::new(ExtensionStep {
            manager: Arc::clone(&self.manager),
            extension: self.extension.clone(),
            step_type: format!("{}.{}", self.alias, operation),
            operation: operation.to_string(),
            args,
        }))
    }
}

/// One extension operation call with fixed arguments.
pub struct ExtensionStep {
    manager: Arc<ExtensionManager>,
    extension: String,
    step_type: String,
    operation: String,
    args: Value,
}

#[async_trait]
impl StepRunner for ExtensionStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    async fn execute(&self, input: &StepInput<'_>) -> Result<StepOutput, StepError> {
        let wrap = |source: ExtensionError| StepError::Extension {
            context: format!("failed to execute {}", self.step_type),
            source,
        };

        // A child token so the timeout can stop the call without touching
        // the caller's token.
        let cancel = input.cancel.child_token();
        let client = self.manager.get(&cancel, &self.extension).await.map_err(wrap)?;

        let params = ExecuteParams {
            operation: self.operation.clone(),
            args: self.args.clone(),
            context: ExecuteContext {
                workdir: input.workdir.display().to_string(),
                env: input.env.clone(),
                agent: input.agent.map(|a| AgentInfo {
                    prompt: a.prompt.clone(),
                    output: a.output.clone(),
                }),
            },
        };

        debug!(step = %self.step_type, "Executing extension operation");

        let result = match tokio::time::timeout(EXTENSION_TIMEOUT, client.execute(&cancel, &params)).await {
            Ok(res) => res.map_err(wrap)?,
            Err(_) => {
                cancel.cancel();
                return Err(wrap(ExtensionError::Timeout(EXTENSION_TIMEOUT)));
            }
        };

        Ok(StepOutput {
            step_type: self.step_type.clone(),
            success: result.success,
            message: result.message,
            error: result.error,
            outputs: result.outputs,
            usage: None,
        })
    }
}
