//! Newline-delimited JSON-RPC connection over a child's stdio.
//!
//! A background reader task routes responses to the waiting caller and hands
//! notifications to a handler. Requests coming from the extension are
//! answered with a null result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{Message, RpcError};
use super::ExtensionError;

/// Receives `(method, params)` for every notification.
pub type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

pub struct RpcConnection {
    writer: Arc<Mutex<Option<ChildStdin>>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

/// Removes a pending entry if the caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.remove(&self.id);
    }
}

impl RpcConnection {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout, handler: NotificationHandler) -> Self {
        let writer = Arc::new(Mutex::new(Some(stdin)));
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            BufReader::new(stdout),
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&closed),
            handler,
        ));

        Self {
            writer,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Sends a request and waits for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ExtensionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExtensionError::ConnectionClosed);
        }

        let line = Message::request(id, method, params).to_line()?;
        self.write(&line).await?;

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(ExtensionError::Rpc {
                code: e.code,
                message: e.message,
            }),
            Err(_) => Err(ExtensionError::ConnectionClosed),
        }
    }

    async fn write(&self, line: &str) -> Result<(), ExtensionError> {
        write_line(&self.writer, line).await
    }

    /// Closes stdin, stops the reader and fails every waiting call.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.reader.abort();
        fail_pending(&self.pending);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_line(writer: &Mutex<Option<ChildStdin>>, line: &str) -> Result<(), ExtensionError> {
    let mut guard = writer.lock().await;
    let stdin = guard.as_mut().ok_or(ExtensionError::ConnectionClosed)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn fail_pending(pending: &Pending) {
    let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
    // Dropping the senders wakes the callers with ConnectionClosed.
    pending.clear();
}

async fn read_loop(
    mut stdout: BufReader<ChildStdout>,
    writer: Arc<Mutex<Option<ChildStdin>>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    handler: NotificationHandler,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => {
                debug!("Extension stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read from extension");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let msg: Message = match serde_json::from_str(trimmed) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, line = %trimmed, "Ignoring malformed message from extension");
                continue;
            }
        };

        if msg.is_response() {
            let Some(id) = msg.id.as_ref().and_then(Value::as_u64) else {
                warn!(id = ?msg.id, "Ignoring response with unknown id");
                continue;
            };
            let tx = {
                let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
                pending.remove(&id)
            };
            if let Some(tx) = tx {
                let outcome = match msg.error {
                    Some(err) => Err(err),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
        } else if msg.is_request() {
            let (Some(id), Some(method)) = (msg.id, msg.method) else {
                continue;
            };
            debug!(method = %method, "Extension sent a request; replying with null");
            let reply = Message::response(id, Value::Null);
            if let Ok(reply) = reply.to_line() {
                if let Err(e) = write_line(&writer, &reply).await {
                    debug!(error = %e, "Failed to reply to extension request");
                }
            }
        } else if let Some(method) = msg.method {
            handler(&method, msg.params.unwrap_or(Value::Null));
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
}
