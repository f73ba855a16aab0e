//! Client for a single extension process.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::connection::{NotificationHandler, RpcConnection};
use super::protocol::{
    ExecuteParams, ExecuteResult, InitializeParams, InitializeResult, LogParams, METHOD_EXECUTE,
    METHOD_INITIALIZE, METHOD_LOG, METHOD_SHUTDOWN, PROTOCOL_VERSION,
};
use super::ExtensionError;
use crate::error::ErrorList;

/// Upper bound for the `shutdown` RPC, independent of the caller's token.
pub const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of an extension process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Unstarted,
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionState::Unstarted => "unstarted",
            ExtensionState::Starting => "starting",
            ExtensionState::Ready => "ready",
            ExtensionState::ShuttingDown => "shutting_down",
            ExtensionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// How to launch an extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionOptions {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl ExtensionOptions {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One running extension: its process, its JSON-RPC connection and the
/// manifest it reported on `initialize`.
///
/// Calls are serialized: the call lock is held from sending a request until
/// its response arrives.
pub struct ExtensionClient {
    alias: String,
    opts: ExtensionOptions,
    state: StdMutex<ExtensionState>,
    child: Mutex<Option<Child>>,
    conn: Mutex<Option<Arc<RpcConnection>>>,
    call_lock: Mutex<()>,
    manifest: InitializeResult,
}

impl fmt::Debug for ExtensionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionClient")
            .field("alias", &self.alias)
            .field("command", &self.opts.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ExtensionClient {
    pub fn new(alias: impl Into<String>, opts: ExtensionOptions) -> Self {
        Self {
            alias: alias.into(),
            opts,
            state: StdMutex::new(ExtensionState::Unstarted),
            child: Mutex::new(None),
            conn: Mutex::new(None),
            call_lock: Mutex::new(()),
            manifest: InitializeResult::default(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn state(&self) -> ExtensionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ExtensionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// The manifest returned by `initialize`. Empty before [`start`](Self::start).
    pub fn manifest(&self) -> &InitializeResult {
        &self.manifest
    }

    /// Spawns the process, connects and performs the `initialize` handshake.
    ///
    /// On any failure the process is killed and the client returns to
    /// `Unstarted`.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), ExtensionError> {
        if self.state() != ExtensionState::Unstarted {
            return Err(ExtensionError::NotReady {
                alias: self.alias.clone(),
                state: self.state(),
            });
        }
        self.set_state(ExtensionState::Starting);

        match self.spawn_and_initialize(cancel).await {
            Ok(manifest) => {
                if manifest.protocol_version != PROTOCOL_VERSION {
                    warn!(
                        extension = %self.alias,
                        expected = PROTOCOL_VERSION,
                        got = %manifest.protocol_version,
                        "Extension speaks a different protocol version"
                    );
                }
                info!(
                    extension = %self.alias,
                    operations = manifest.operations.len(),
                    "Extension ready"
                );
                self.manifest = manifest;
                self.set_state(ExtensionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.close_conn().await;
                if let Some(mut child) = self.child.lock().await.take() {
                    if let Err(kill_err) = child.kill().await {
                        debug!(extension = %self.alias, error = %kill_err, "Failed to kill extension after start failure");
                    }
                }
                self.set_state(ExtensionState::Unstarted);
                Err(e)
            }
        }
    }

    async fn spawn_and_initialize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InitializeResult, ExtensionError> {
        let mut cmd = Command::new(&self.opts.command);
        cmd.args(&self.opts.args)
            .envs(&self.opts.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.opts.workdir {
            cmd.current_dir(dir);
        }

        debug!(extension = %self.alias, command = %self.opts.command.display(), "Spawning extension");

        let mut child = cmd.spawn().map_err(|e| ExtensionError::Spawn {
            command: self.opts.command.display().to_string(),
            source: e,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.child.lock().await = Some(child);

        let stdin = stdin.ok_or(ExtensionError::MissingPipe("stdin"))?;
        let stdout = stdout.ok_or(ExtensionError::MissingPipe("stdout"))?;

        if let Some(stderr) = stderr {
            let alias = self.alias.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(extension = %alias, "stderr: {}", line);
                }
            });
        }

        let conn = Arc::new(RpcConnection::new(stdin, stdout, log_handler(&self.alias)));
        *self.conn.lock().await = Some(conn);

        let params = serde_json::to_value(InitializeParams::default())?;
        self.call(cancel, METHOD_INITIALIZE, params)
            .await
            .map_err(|e| ExtensionError::Initialize(Box::new(e)))
    }

    /// Runs one operation.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        params: &ExecuteParams,
    ) -> Result<ExecuteResult, ExtensionError> {
        let state = self.state();
        if state != ExtensionState::Ready {
            return Err(ExtensionError::NotReady {
                alias: self.alias.clone(),
                state,
            });
        }

        self.call(cancel, METHOD_EXECUTE, serde_json::to_value(params)?)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<T, ExtensionError> {
        let _serial = self.call_lock.lock().await;
        let conn = self
            .conn
            .lock()
            .await
            .clone()
            .ok_or(ExtensionError::ConnectionClosed)?;

        trace!(extension = %self.alias, method, "Calling extension");

        let value = tokio::select! {
            res = conn.call(method, params) => res?,
            _ = cancel.cancelled() => return Err(ExtensionError::Cancelled),
        };

        Ok(serde_json::from_value(value)?)
    }

    /// Stops the extension.
    ///
    /// The `shutdown` RPC is bounded by [`SHUTDOWN_RPC_TIMEOUT`]. If it
    /// fails, the process is killed right away. If it succeeds, the natural
    /// exit is awaited until `cancel` fires, after which the process is
    /// killed and reaped. All errors met on the way are returned together.
    /// Stopping an already stopped extension is a no-op.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), ExtensionError> {
        if self.state() == ExtensionState::Stopped {
            return Ok(());
        }
        self.set_state(ExtensionState::ShuttingDown);

        let rpc = tokio::time::timeout(
            SHUTDOWN_RPC_TIMEOUT,
            self.call::<Value>(cancel, METHOD_SHUTDOWN, json!({})),
        )
        .await
        .unwrap_or(Err(ExtensionError::Timeout(SHUTDOWN_RPC_TIMEOUT)));

        let Some(mut child) = self.child.lock().await.take() else {
            self.close_conn().await;
            self.set_state(ExtensionState::Stopped);
            return rpc.map(|_| ());
        };

        let mut errors = ErrorList::new();

        if let Err(rpc_err) = rpc {
            warn!(extension = %self.alias, error = %rpc_err, "Shutdown RPC failed, killing extension");
            errors.push(rpc_err);
            self.close_conn().await;
            if let Err(e) = child.kill().await {
                errors.push(ExtensionError::Kill(e.to_string()));
            }
        } else {
            tokio::select! {
                status = child.wait() => {
                    self.close_conn().await;
                    match status {
                        Ok(status) if status.success() => {}
                        Ok(status) => errors.push(ExtensionError::ProcessExit(status.to_string())),
                        Err(e) => errors.push(ExtensionError::Io(e)),
                    }
                }
                _ = cancel.cancelled() => {
                    warn!(extension = %self.alias, "Extension did not exit before cancellation, killing it");
                    self.close_conn().await;
                    errors.push(ExtensionError::Cancelled);
                    if let Err(e) = child.start_kill() {
                        errors.push(ExtensionError::Kill(e.to_string()));
                    }
                    match child.wait().await {
                        Ok(status) if status.success() => {}
                        Ok(status) => errors.push(ExtensionError::ProcessExit(status.to_string())),
                        Err(e) => errors.push(ExtensionError::Io(e)),
                    }
                }
            }
        }

        self.set_state(ExtensionState::Stopped);
        debug!(extension = %self.alias, errors = errors.len(), "Extension stopped");

        match ExtensionError::join(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn close_conn(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(conn) = conn.take() {
            conn.close().await;
        }
    }
}

/// Forwards `log` notifications into tracing.
fn log_handler(alias: &str) -> NotificationHandler {
    let alias = alias.to_string();
    Arc::new(move |method: &str, params: Value| {
        if method != METHOD_LOG {
            trace!(extension = %alias, method, "Ignoring notification");
            return;
        }
        let Ok(log) = serde_json::from_value::<LogParams>(params) else {
            return;
        };
        let data = Value::Object(log.data);
        match log.level.to_ascii_lowercase().as_str() {
            "error" => error!(extension = %alias, data = %data, "{}", log.message),
            "warn" | "warning" => warn!(extension = %alias, data = %data, "{}", log.message),
            "debug" => debug!(extension = %alias, data = %data, "{}", log.message),
            "trace" => trace!(extension = %alias, data = %data, "{}", log.message),
            _ => info!(extension = %alias, data = %data, "{}", log.message),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_log_notifications_reach_tracing() {
        let handler = log_handler("demo");

        let logs = capture_logs(|| {
            handler(
                METHOD_LOG,
                json!({"level": "warning", "message": "disk almost full", "data": {"free": 3}}),
            )
        });
        assert!(logs.contains("WARN"), "{}", logs);
        assert!(logs.contains("disk almost full"), "{}", logs);
        assert!(logs.contains("extension=demo"), "{}", logs);
        assert!(logs.contains("free"), "{}", logs);

        let logs = capture_logs(|| {
            handler(METHOD_LOG, json!({"level": "notice", "message": "hello"}))
        });
        assert!(logs.contains("INFO") && logs.contains("hello"), "{}", logs);
    }

    #[test]
    fn test_other_notifications_ignored() {
        let handler = log_handler("demo");

        let logs = capture_logs(|| handler("progress", json!({"message": "50%"})));
        assert!(logs.is_empty(), "{}", logs);

        // Unparseable log params are dropped.
        let logs = capture_logs(|| handler(METHOD_LOG, json!({"level": 3, "message": "x"})));
        assert!(logs.is_empty(), "{}", logs);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExtensionState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(ExtensionState::Ready.to_string(), "ready");
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails_cleanly() {
        let mut client = ExtensionClient::new(
            "missing",
            ExtensionOptions::new("/definitely/not/a/real/extension"),
        );
        let err = client.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Spawn { .. }));
        assert_eq!(client.state(), ExtensionState::Unstarted);
    }

    #[tokio::test]
    async fn test_start_non_protocol_process_fails() {
        // `true` exits immediately without answering initialize.
        let mut client = ExtensionClient::new("silent", ExtensionOptions::new("true"));
        let err = client.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Initialize(_)));
        assert_eq!(client.state(), ExtensionState::Unstarted);
    }

    #[tokio::test]
    async fn test_execute_requires_ready() {
        let client = ExtensionClient::new("idle", ExtensionOptions::new("true"));
        let err = client
            .execute(&CancellationToken::new(), &ExecuteParams::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtensionError::NotReady {
                state: ExtensionState::Unstarted,
                ..
            }
        ));
    }
}
