//! `kind: Task` documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ConfigError, ConfigResult};
use crate::judge::JudgeCriteria;
use crate::meta::{PromptSource, TypeMeta, API_VERSION_V1ALPHA1};
use crate::steps::StepConfig;

pub const KIND_TASK: &str = "Task";

pub const DIFFICULTY_EASY: &str = "easy";
pub const DIFFICULTY_MEDIUM: &str = "medium";
pub const DIFFICULTY_HARD: &str = "hard";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Something a task needs from the eval: an extension or an MCP server,
/// optionally under a local alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<StepConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<StepConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<StepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptSource>,
    /// Extra environment for every step of the task. Step level `env`
    /// entries win over these.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// A loaded task. Relative paths inside it resolve against `base_path`, the
/// directory of the file it came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    pub metadata: TaskMetadata,
    pub spec: TaskSpec,
    #[serde(skip)]
    pub base_path: PathBuf,
}

/// The older `steps:` layout with one script per phase.
#[derive(Debug, Default, Deserialize)]
struct StepsV1Alpha1 {
    #[serde(default)]
    setup: Option<PromptSource>,
    #[serde(default)]
    cleanup: Option<PromptSource>,
    #[serde(default)]
    verify: Option<VerifyV1Alpha1>,
    #[serde(default)]
    prompt: Option<PromptSource>,
}

/// A v1alpha1 verification: a script, or a judge reference answer.
#[derive(Debug, Default, Deserialize)]
struct VerifyV1Alpha1 {
    #[serde(default)]
    inline: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    contains: String,
    #[serde(default)]
    exact: String,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(flatten)]
    type_meta: TypeMeta,
    #[serde(default)]
    metadata: TaskMetadata,
    #[serde(default)]
    spec: Option<TaskSpec>,
    #[serde(default)]
    steps: Option<StepsV1Alpha1>,
}

impl TaskConfig {
    /// Parses a task document. `base_path` is the directory relative paths
    /// are resolved against.
    pub fn read(data: &str, base_path: &Path) -> ConfigResult<Self> {
        // Check the header first so foreign documents are reported as
        // WrongKind even when the rest would not parse as a task.
        let header: TypeMeta = serde_yaml::from_str(data)?;
        header.validate(KIND_TASK)?;

        let raw: RawTask = serde_yaml::from_str(data)?;

        let mut spec = if raw.type_meta.api_version() == API_VERSION_V1ALPHA1 {
            let steps = raw
                .steps
                .ok_or_else(|| ConfigError::Invalid("v1alpha1 requires steps field".to_string()))?;
            translate_v1alpha1(steps, base_path)?
        } else {
            raw.spec
                .ok_or_else(|| ConfigError::Invalid("task spec is required".to_string()))?
        };

        if let Some(prompt) = &mut spec.prompt {
            prompt.resolve_path(base_path);
        }

        Ok(Self {
            type_meta: raw.type_meta,
            metadata: raw.metadata,
            spec,
            base_path: base_path.to_path_buf(),
        })
    }

    /// Loads a task file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let abs = std::path::absolute(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let base = abs.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::read(&data, &base)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

fn script_step(source: &PromptSource, base_path: &Path) -> StepConfig {
    let mut source = source.clone();
    source.resolve_path(base_path);
    let payload = serde_json::to_value(&source).unwrap_or(Value::Null);
    StepConfig::new("script", payload)
}

fn translate_v1alpha1(steps: StepsV1Alpha1, base_path: &Path) -> ConfigResult<TaskSpec> {
    let mut spec = TaskSpec {
        prompt: steps.prompt,
        ..Default::default()
    };

    if let Some(setup) = steps.setup.filter(|s| !s.is_empty()) {
        spec.setup.push(script_step(&setup, base_path));
    }
    if let Some(cleanup) = steps.cleanup.filter(|s| !s.is_empty()) {
        spec.cleanup.push(script_step(&cleanup, base_path));
    }

    if let Some(verify) = steps.verify {
        let script = PromptSource {
            inline: verify.inline.filter(|s| !s.is_empty()),
            file: verify.file,
        };
        let has_script = !script.is_empty();
        let has_judge = !verify.contains.is_empty() || !verify.exact.is_empty();

        match (has_script, has_judge) {
            (false, false) => {
                return Err(ConfigError::Invalid(
                    "verify.inline, verify.file, verify.exact, or verify.contains must be set"
                        .to_string(),
                ))
            }
            (true, true) => {
                return Err(ConfigError::Invalid(
                    "cannot specify both a verify script (inline/file) and llm judge config (exact/contains)"
                        .to_string(),
                ))
            }
            (true, false) => spec.verify.push(script_step(&script, base_path)),
            (false, true) => {
                let criteria = JudgeCriteria {
                    contains: verify.contains,
                    exact: verify.exact,
                };
                criteria
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("invalid llm judge config: {}", e)))?;
                spec.verify.push(StepConfig::new(
                    "llmJudge",
                    json!({"contains": criteria.contains, "exact": criteria.exact}),
                ));
            }
        }
    }

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1ALPHA2: &str = r#"
apiVersion: taskcheck/v1alpha2
kind: Task
metadata:
  name: list contexts
  difficulty: easy
  labels:
    suite: k8s
spec:
  requires:
    - extension: kubernetes
      as: k8s
  setup:
    - k8s.listContexts: {}
  verify:
    - llmJudge:
        contains: "{steps.k8s.listContexts.current}"
  prompt:
    file: prompt.md
"#;

    #[test]
    fn test_read_v1alpha2() {
        let cfg = TaskConfig::read(V1ALPHA2, Path::new("/tasks/k8s")).unwrap();
        assert_eq!(cfg.name(), "list contexts");
        assert_eq!(cfg.metadata.labels["suite"], "k8s");
        assert_eq!(cfg.spec.requires[0].alias.as_deref(), Some("k8s"));
        assert_eq!(cfg.spec.setup[0].entry().unwrap().0, "k8s.listContexts");
        assert_eq!(
            cfg.spec.prompt.as_ref().unwrap().file.as_deref(),
            Some(Path::new("/tasks/k8s/prompt.md"))
        );
        assert_eq!(cfg.base_path, PathBuf::from("/tasks/k8s"));
    }

    #[test]
    fn test_read_v1alpha1_scripts() {
        let doc = r#"
kind: Task
metadata:
  name: create pod inline
  difficulty: easy
steps:
  setup:
    inline: kubectl create namespace create-pod-test
  verify:
    file: verify.sh
  cleanup:
    inline: kubectl delete namespace create-pod-test
  prompt:
    inline: Please create a nginx pod
"#;
        let cfg = TaskConfig::read(doc, Path::new("/tasks")).unwrap();
        assert_eq!(cfg.spec.setup.len(), 1);
        assert_eq!(
            cfg.spec.setup[0].config["script"],
            json!({"inline": "kubectl create namespace create-pod-test"})
        );
        assert_eq!(
            cfg.spec.verify[0].config["script"],
            json!({"file": "/tasks/verify.sh"})
        );
        assert_eq!(cfg.spec.cleanup.len(), 1);
        assert_eq!(
            cfg.spec.prompt.unwrap().inline.as_deref(),
            Some("Please create a nginx pod")
        );
    }

    #[test]
    fn test_read_v1alpha1_judge() {
        let doc = r#"
kind: Task
metadata:
  name: judge
steps:
  verify:
    contains: nginx
  prompt:
    inline: hi
"#;
        let cfg = TaskConfig::read(doc, Path::new("/tasks")).unwrap();
        let (step_type, payload) = cfg.spec.verify[0].entry().unwrap();
        assert_eq!(step_type, "llmJudge");
        assert_eq!(payload["contains"], "nginx");
    }

    #[test]
    fn test_read_v1alpha1_rejects_script_and_judge() {
        let doc = "kind: Task\nsteps:\n  verify:\n    inline: x\n    exact: y\n";
        let err = TaskConfig::read(doc, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("cannot specify both"));
    }

    #[test]
    fn test_read_v1alpha1_requires_steps() {
        let err = TaskConfig::read("kind: Task\nmetadata:\n  name: x\n", Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("v1alpha1 requires steps field"));
    }

    #[test]
    fn test_wrong_kind() {
        let err = TaskConfig::read(
            "kind: Eval\nmetadata:\n  name: x\nconfig: {}\n",
            Path::new("/"),
        )
        .unwrap_err();
        assert!(err.is_wrong_kind());
    }

    #[test]
    fn test_from_file_sets_base_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.yaml");
        std::fs::write(&path, V1ALPHA2).unwrap();
        let cfg = TaskConfig::from_file(&path).unwrap();
        assert_eq!(cfg.base_path, dir.path());
    }
}
