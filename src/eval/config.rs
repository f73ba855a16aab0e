//! `kind: Eval` documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::assertions::TaskAssertions;
use crate::agent::AgentSpec;
use crate::error::{ConfigError, ConfigResult};
use crate::extension::ExtensionRef;
use crate::judge::JudgeConfig;
use crate::mcp::McpServerConfig;
use crate::meta::TypeMeta;

pub const KIND_EVAL: &str = "Eval";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetadata {
    #[serde(default)]
    pub name: String,
}

/// A group of task files sharing a label selector and assertions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSet {
    /// Glob pattern. `*` and `?` stay within one path component, `**`
    /// crosses directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub label_selector: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertions: Option<TaskAssertions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_judge: Option<JudgeConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, ExtensionRef>,
    #[serde(default)]
    pub task_sets: Vec<TaskSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSpec {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: EvalMetadata,
    #[serde(default)]
    pub config: EvalConfig,
    #[serde(skip)]
    base_path: PathBuf,
}

impl EvalSpec {
    /// Parses an eval document. Task set paths are resolved against
    /// `base_path`.
    pub fn read(data: &str, base_path: &Path) -> ConfigResult<Self> {
        let header: TypeMeta = serde_yaml::from_str(data)?;
        header.validate(KIND_EVAL)?;

        let mut spec: EvalSpec = serde_yaml::from_str(data)?;
        spec.base_path = base_path.to_path_buf();

        for (i, set) in spec.config.task_sets.iter_mut().enumerate() {
            match (&set.glob, &set.path) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "taskSets[{}]: only one of glob or path can be set",
                        i
                    )))
                }
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "taskSets[{}]: one of glob or path must be set",
                        i
                    )))
                }
                _ => {}
            }
            set.glob = set.glob.take().map(|g| resolve(base_path, &g));
            set.path = set.path.take().map(|p| resolve(base_path, &p));
            if let Some(assertions) = &set.assertions {
                assertions.validate()?;
            }
        }

        Ok(spec)
    }

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

    /// Directory the document was loaded from.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Merges a `k=v,k2=v2` selector into every task set.
    pub fn apply_label_selector(&mut self, selector: &str) -> ConfigResult<()> {
        let parsed = parse_label_selector(selector)?;
        for set in &mut self.config.task_sets {
            set.label_selector
                .extend(parsed.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }
}

fn resolve(base: &Path, value: &str) -> String {
    let path = Path::new(value);
    if path.is_absolute() {
        value.to_string()
    } else {
        base.join(path).display().to_string()
    }
}

/// Parses `k=v,k2=v2`. Blank input yields an empty selector.
pub fn parse_label_selector(selector: &str) -> ConfigResult<HashMap<String, String>> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(ConfigError::Invalid(format!(
                "invalid label selector {:?}: expected key=value",
                pair
            ))),
        })
        .collect()
}

/// True when every selector pair is present with the same value in `labels`.
pub fn matches_label_selector(
    labels: &HashMap<String, String>,
    selector: &HashMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVAL: &str = r#"
apiVersion: taskcheck/v1alpha2
kind: Eval
metadata:
  name: k8s-basic
config:
  agent:
    type: command
    runPrompt: my-agent -p {prompt}
  mcpServers:
    - name: kube
      url: http://localhost:8080/mcp
  llmJudge:
    env:
      typeKey: JUDGE_TYPE
      baseUrlKey: JUDGE_BASE_URL
      apiKeyKey: JUDGE_API_KEY
      modelNameKey: JUDGE_MODEL_NAME
  extensions:
    kubernetes:
      command: ./bin/kube-ext
  taskSets:
    - glob: tasks/*/*.yaml
      labelSelector:
        suite: k8s
      assertions:
        toolsUsed:
          - server: kube
            tool: pods_list
    - path: /abs/task.yaml
"#;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_read_eval() {
        let spec = EvalSpec::read(EVAL, Path::new("/evals")).unwrap();
        assert_eq!(spec.name(), "k8s-basic");
        assert!(matches!(spec.config.agent, Some(AgentSpec::Command(_))));
        assert_eq!(spec.config.mcp_servers[0].name, "kube");
        assert_eq!(spec.config.extensions["kubernetes"].command, "./bin/kube-ext");
        assert_eq!(
            spec.config.task_sets[0].glob.as_deref(),
            Some("/evals/tasks/*/*.yaml")
        );
        assert_eq!(spec.config.task_sets[1].path.as_deref(), Some("/abs/task.yaml"));
        assert!(spec.config.task_sets[0].assertions.is_some());
        assert_eq!(spec.base_path(), Path::new("/evals"));
    }

    #[test]
    fn test_task_set_needs_one_source() {
        let doc = "kind: Eval\nconfig:\n  taskSets:\n    - labelSelector: {a: b}\n";
        let err = EvalSpec::read(doc, Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("one of glob or path must be set"));
    }

    #[test]
    fn test_wrong_kind() {
        let err = EvalSpec::read("kind: Task\nmetadata:\n  name: t\n", Path::new("/")).unwrap_err();
        assert!(err.is_wrong_kind());
    }

    #[test]
    fn test_apply_label_selector() {
        let mut spec = EvalSpec::read(EVAL, Path::new("/evals")).unwrap();
        spec.apply_label_selector("tier=basic, suite=core").unwrap();
        assert_eq!(
            spec.config.task_sets[0].label_selector,
            labels(&[("suite", "core"), ("tier", "basic")])
        );
        assert_eq!(
            spec.config.task_sets[1].label_selector,
            labels(&[("suite", "core"), ("tier", "basic")])
        );

        assert!(spec.apply_label_selector("nope").is_err());
        assert!(spec.apply_label_selector("=x").is_err());
    }

    #[test]
    fn test_label_selector_and_semantics() {
        let task = labels(&[("suite", "k8s"), ("tier", "basic")]);
        assert!(matches_label_selector(&task, &labels(&[("suite", "k8s")])));
        assert!(!matches_label_selector(
            &task,
            &labels(&[("suite", "k8s"), ("tier", "pro")])
        ));
        assert!(matches_label_selector(&HashMap::new(), &HashMap::new()));
        assert!(!matches_label_selector(&HashMap::new(), &labels(&[("suite", "k8s")])));
    }
}
