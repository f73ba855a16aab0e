//! `script` step: runs a shell snippet or script file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::template::{Sources, StepOutputResolver, Template, SOURCE_RANDOM, SOURCE_STEPS};
use super::{StepError, StepInput, StepOutput, StepRunner, DEFAULT_TIMEOUT};

const ALLOWED_SOURCES: &[&str] = &[SOURCE_RANDOM, SOURCE_STEPS];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScriptConfig {
    #[serde(default)]
    inline: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Debug)]
enum ScriptSource {
    Inline(Template),
    File(PathBuf),
}

/// Runs a script and reports its trimmed stdout and exit code.
///
/// Scripts starting with a `#!` line are executed directly so the shebang
/// picks the interpreter; anything else goes through `bash`.
#[derive(Debug)]
pub struct ScriptStep {
    source: ScriptSource,
    args: Vec<String>,
    env: Vec<(String, Template)>,
    timeout: Duration,
    continue_on_error: bool,
}

impl ScriptStep {
    pub const TYPE: &'static str = "script";

    pub fn parse(raw: &Value) -> Result<Self, StepError> {
        let cfg: ScriptConfig =
            serde_json::from_value(raw.clone()).map_err(|source| StepError::Parse {
                step_type: Self::TYPE.to_string(),
                source,
            })?;

        let source = match (cfg.inline, cfg.file) {
            (Some(inline), None) => {
                ScriptSource::Inline(Template::parse(&inline, ALLOWED_SOURCES)?)
            }
            (None, Some(file)) => ScriptSource::File(file),
            (Some(_), Some(_)) => {
                return Err(StepError::InvalidConfig(
                    "script: only one of inline or file can be set".to_string(),
                ))
            }
            (None, None) => {
                return Err(StepError::InvalidConfig(
                    "script: one of inline or file must be set".to_string(),
                ))
            }
        };

        let mut env = cfg
            .env
            .into_iter()
            .map(|(k, v)| -> Result<_, StepError> {
                Ok((k, Template::parse(&v, ALLOWED_SOURCES)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        env.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            source,
            args: cfg.args,
            env,
            timeout: cfg.timeout.unwrap_or(DEFAULT_TIMEOUT),
            continue_on_error: cfg.continue_on_error,
        })
    }

    async fn content(&self, input: &StepInput<'_>, sources: &Sources<'_>) -> Result<String, StepError> {
        match &self.source {
            ScriptSource::Inline(tpl) => Ok(tpl.render(sources)?),
            ScriptSource::File(path) => {
                let path = if path.is_relative() {
                    input.workdir.join(path)
                } else {
                    path.clone()
                };
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    StepError::InvalidConfig(format!(
                        "failed to read script file {}: {}",
                        path.display(),
                        e
                    ))
                })
            }
        }
    }
}

#[async_trait]
impl StepRunner for ScriptStep {
    fn step_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, input: &StepInput<'_>) -> Result<StepOutput, StepError> {
        let steps = StepOutputResolver::new(input.step_outputs);
        let sources = Sources::new()
            .with(SOURCE_RANDOM, input.random)
            .with(SOURCE_STEPS, &steps);

        let content = self.content(input, &sources).await?;

        // Holds the shebang script on disk until the command is done.
        let scratch = tempfile::tempdir()?;

        let mut cmd = if content.starts_with("#!") {
            let path = scratch.path().join("script");
            tokio::fs::write(&path, &content).await?;
            make_executable(&path)?;
            let mut cmd = Command::new(&path);
            cmd.args(&self.args);
            cmd
        } else {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(&content).arg("bash").args(&self.args);
            cmd
        };

        cmd.current_dir(input.workdir)
            .envs(input.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, tpl) in &self.env {
            cmd.env(key, tpl.render(&sources)?);
        }

        debug!(workdir = %input.workdir.display(), timeout = ?self.timeout, "Running script");

        let child = cmd.spawn()?;
        let output = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(output) => output?,
                Err(_) => return Err(StepError::Timeout(self.timeout)),
            },
            _ = input.cancel.cancelled() => return Err(StepError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        let outputs = HashMap::from([
            ("stdout".to_string(), stdout),
            ("exitCode".to_string(), exit_code.to_string()),
        ]);

        if output.status.success() {
            return Ok(StepOutput::success(Self::TYPE, "script completed").with_outputs(outputs));
        }

        if self.continue_on_error {
            warn!(exit_code, stderr = %stderr, "Script failed; continuing");
            return Ok(StepOutput::failure(
                Self::TYPE,
                format!("script exited with {}: {}", output.status, stderr),
            )
            .with_outputs(outputs));
        }

        Err(StepError::ScriptFailed {
            status: output.status.to_string(),
            stderr,
        })
    }
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
