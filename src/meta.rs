//! Document header and small config building blocks shared by task and eval
//! documents.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub const API_VERSION_V1ALPHA1: &str = "taskcheck/v1alpha1";
pub const API_VERSION_V1ALPHA2: &str = "taskcheck/v1alpha2";

/// `apiVersion` + `kind` header carried by every document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

impl TypeMeta {
    /// The effective API version. An empty version means v1alpha1.
    pub fn api_version(&self) -> &str {
        if self.api_version.is_empty() {
            API_VERSION_V1ALPHA1
        } else {
            &self.api_version
        }
    }

    /// Checks the header against the expected kind.
    ///
    /// A kind mismatch wins over an unknown version so discovery can skip
    /// foreign documents regardless of their version.
    pub fn validate(&self, expected_kind: &str) -> ConfigResult<()> {
        if self.kind != expected_kind {
            return Err(ConfigError::WrongKind {
                found: self.kind.clone(),
                expected: expected_kind.to_string(),
            });
        }

        match self.api_version.as_str() {
            "" | API_VERSION_V1ALPHA1 | API_VERSION_V1ALPHA2 => Ok(()),
            other => Err(ConfigError::UnknownApiVersion(other.to_string())),
        }
    }
}

/// Text given either inline or as a path to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl PromptSource {
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            inline: Some(text.into()),
            file: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inline.as_deref().map_or(true, str::is_empty) && self.file.is_none()
    }

    /// Makes a relative `file` absolute against `base`.
    pub fn resolve_path(&mut self, base: &Path) {
        if let Some(file) = &self.file {
            if file.is_relative() {
                self.file = Some(base.join(file));
            }
        }
    }

    /// Returns the text, reading the file when needed.
    pub fn value(&self) -> ConfigResult<String> {
        match (&self.inline, &self.file) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "only one of inline or file may be set".to_string(),
            )),
            (Some(text), None) => Ok(text.clone()),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            }),
            (None, None) => Err(ConfigError::Invalid(
                "one of inline or file must be set".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_meta_defaults_to_v1alpha1() {
        let meta = TypeMeta {
            api_version: String::new(),
            kind: "Task".into(),
        };
        assert_eq!(meta.api_version(), API_VERSION_V1ALPHA1);
        assert!(meta.validate("Task").is_ok());
    }

    #[test]
    fn test_type_meta_rejects_unknown_version() {
        let meta = TypeMeta {
            api_version: "taskcheck/v9".into(),
            kind: "Task".into(),
        };
        assert!(matches!(
            meta.validate("Task"),
            Err(ConfigError::UnknownApiVersion(_))
        ));
    }

    #[test]
    fn test_type_meta_wrong_kind() {
        let meta = TypeMeta {
            api_version: API_VERSION_V1ALPHA2.into(),
            kind: "Eval".into(),
        };
        assert!(meta.validate("Task").unwrap_err().is_wrong_kind());
    }

    #[test]
    fn test_prompt_source_file_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prompt.md"), "do the thing").unwrap();

        let mut src = PromptSource {
            inline: None,
            file: Some(PathBuf::from("prompt.md")),
        };
        src.resolve_path(dir.path());
        assert!(src.file.as_ref().unwrap().is_absolute());
        assert_eq!(src.value().unwrap(), "do the thing");
    }

    #[test]
    fn test_prompt_source_empty() {
        assert!(PromptSource::default().is_empty());
        assert!(!PromptSource::inline("hi").is_empty());
        assert!(PromptSource::default().value().is_err());
    }
}
