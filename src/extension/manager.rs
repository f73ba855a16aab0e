//! Alias-keyed registry of extensions, started on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ExtensionClient, ExtensionError, ExtensionOptions};
use crate::error::ErrorList;

/// Where to find an extension, as written in the eval config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRef {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl ExtensionRef {
    /// Turns the reference into launch options. Commands containing a path
    /// separator are resolved against `base_dir`; bare names go through PATH.
    fn to_options(&self, base_dir: &Path) -> ExtensionOptions {
        let command = PathBuf::from(&self.command);
        let command = if command.is_relative() && self.command.contains('/') {
            base_dir.join(command)
        } else {
            command
        };

        ExtensionOptions {
            command,
            args: self.args.clone(),
            env: self.env.clone(),
            workdir: Some(base_dir.to_path_buf()),
        }
    }
}

struct Slot {
    reference: ExtensionRef,
    client: OnceCell<Arc<ExtensionClient>>,
}

/// Registered extensions for one evaluation run.
///
/// Registration happens up front; [`get`](Self::get) starts a client the
/// first time its alias is asked for and hands out the same instance after
/// that, even under concurrent callers.
pub struct ExtensionManager {
    base_dir: PathBuf,
    slots: HashMap<String, Slot>,
}

impl ExtensionManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            slots: HashMap::new(),
        }
    }

    /// Records an extension without starting it.
    pub fn register(&mut self, alias: &str, reference: ExtensionRef) -> Result<(), ExtensionError> {
        if self.slots.contains_key(alias) {
            return Err(ExtensionError::AlreadyRegistered(alias.to_string()));
        }
        debug!(extension = %alias, command = %reference.command, "Registered extension");
        self.slots.insert(
            alias.to_string(),
            Slot {
                reference,
                client: OnceCell::new(),
            },
        );
        Ok(())
    }

    pub fn has(&self, alias: &str) -> bool {
        self.slots.contains_key(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Returns the running client for `alias`, starting it if needed.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        alias: &str,
    ) -> Result<Arc<ExtensionClient>, ExtensionError> {
        let slot = self
            .slots
            .get(alias)
            .ok_or_else(|| ExtensionError::NotRegistered(alias.to_string()))?;

        let client = slot
            .client
            .get_or_try_init(|| async {
                info!(extension = %alias, "Starting extension");
                let mut client =
                    ExtensionClient::new(alias, slot.reference.to_options(&self.base_dir));
                client
                    .start(cancel)
                    .await
                    .map_err(|e| ExtensionError::Start {
                        alias: alias.to_string(),
                        source: Box::new(e),
                    })?;
                Ok::<_, ExtensionError>(Arc::new(client))
            })
            .await?;

        Ok(Arc::clone(client))
    }

    /// Shuts down every extension that was started. Unstarted ones are left
    /// alone.
    pub async fn shutdown_all(&self, cancel: &CancellationToken) -> Result<(), ExtensionError> {
        let mut errors = ErrorList::new();

        for (alias, slot) in &self.slots {
            let Some(client) = slot.client.get() else {
                continue;
            };
            info!(extension = %alias, "Stopping extension");
            if let Err(e) = client.shutdown(cancel).await {
                errors.push(e);
            }
        }

        match ExtensionError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_duplicate() {
        let mut manager = ExtensionManager::new("/tmp");
        let ext = ExtensionRef {
            command: "demo".into(),
            ..Default::default()
        };
        manager.register("demo", ext.clone()).unwrap();
        let err = manager.register("demo", ext).unwrap_err();
        assert!(matches!(err, ExtensionError::AlreadyRegistered(a) if a == "demo"));
        assert!(manager.has("demo"));
        assert!(!manager.has("other"));
    }

    #[test]
    fn test_command_resolution() {
        let base = Path::new("/evals/suite");
        let relative = ExtensionRef {
            command: "./bin/ext".into(),
            ..Default::default()
        };
        assert_eq!(
            relative.to_options(base).command,
            PathBuf::from("/evals/suite/./bin/ext")
        );

        let bare = ExtensionRef {
            command: "kube-ext".into(),
            ..Default::default()
        };
        assert_eq!(bare.to_options(base).command, PathBuf::from("kube-ext"));

        let absolute = ExtensionRef {
            command: "/usr/bin/ext".into(),
            ..Default::default()
        };
        assert_eq!(absolute.to_options(base).command, PathBuf::from("/usr/bin/ext"));
    }

    #[tokio::test]
    async fn test_get_unregistered() {
        let manager = ExtensionManager::new("/tmp");
        let err = manager
            .get(&CancellationToken::new(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_shutdown_all_with_nothing_started() {
        let mut manager = ExtensionManager::new("/tmp");
        manager
            .register(
                "lazy",
                ExtensionRef {
                    command: "never-started".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(manager.shutdown_all(&CancellationToken::new()).await.is_ok());
    }
}
