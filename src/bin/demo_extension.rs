//! Minimal extension used by the integration tests and as a reference for
//! extension authors.
//!
//! Operations:
//! - `echo`: returns its arguments as outputs. Requires `message`.
//! - `fail`: reports `success: false`.
//! - `env`: returns the value of the variable named by `name`, looked up in
//!   the execute context first and the process environment second.
//!
//! `DEMO_EXTENSION_HANG_ON_SHUTDOWN=1` acknowledges `shutdown` but never
//! exits. `DEMO_EXTENSION_IGNORE_SHUTDOWN=1` never answers `shutdown`.

use std::collections::HashMap;

use serde_json::{json, Value};
use taskcheck::extension::protocol::{
    ExecuteParams, ExecuteResult, InitializeResult, Message, OperationSchema,
    ERROR_INVALID_PARAMS, ERROR_METHOD_NOT_FOUND, METHOD_EXECUTE, METHOD_INITIALIZE, METHOD_LOG,
    METHOD_SHUTDOWN, PROTOCOL_VERSION,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn manifest() -> InitializeResult {
    let operations = HashMap::from([
        (
            "echo".to_string(),
            OperationSchema {
                description: "Returns its arguments as outputs".to_string(),
                params: Some(json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                })),
            },
        ),
        (
            "fail".to_string(),
            OperationSchema {
                description: "Always reports failure".to_string(),
                params: None,
            },
        ),
        (
            "env".to_string(),
            OperationSchema {
                description: "Returns an environment variable".to_string(),
                params: Some(json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                })),
            },
        ),
    ]);

    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        name: "demo-extension".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        operations,
    }
}

fn execute(params: &ExecuteParams) -> ExecuteResult {
    match params.operation.as_str() {
        "echo" => {
            let outputs = params
                .args
                .as_object()
                .map(|args| {
                    args.iter()
                        .map(|(k, v)| {
                            let v = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                            (k.clone(), v)
                        })
                        .collect()
                })
                .unwrap_or_default();
            ExecuteResult {
                success: true,
                message: "echoed".to_string(),
                outputs,
                ..Default::default()
            }
        }
        "fail" => ExecuteResult {
            success: false,
            message: "operation failed on purpose".to_string(),
            error: "demo failure".to_string(),
            ..Default::default()
        },
        "env" => {
            let name = params.args.get("name").and_then(Value::as_str).unwrap_or_default();
            let value = params
                .context
                .env
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
                .unwrap_or_default();
            ExecuteResult {
                success: true,
                message: format!("read {}", name),
                outputs: HashMap::from([("value".to_string(), value)]),
                ..Default::default()
            }
        }
        other => ExecuteResult {
            success: false,
            error: format!("unknown operation {:?}", other),
            ..Default::default()
        },
    }
}

async fn send(stdout: &mut Stdout, msg: &Message) -> anyhow::Result<()> {
    stdout.write_all(msg.to_line()?.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let hang_on_shutdown = flag("DEMO_EXTENSION_HANG_ON_SHUTDOWN");
    let ignore_shutdown = flag("DEMO_EXTENSION_IGNORE_SHUTDOWN");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                eprintln!("demo-extension: ignoring malformed message: {}", e);
                continue;
            }
        };
        let (Some(id), Some(method)) = (msg.id.clone(), msg.method.as_deref()) else {
            continue;
        };
        let params = msg.params.clone().unwrap_or(Value::Null);

        match method {
            METHOD_INITIALIZE => {
                send(&mut stdout, &Message::response(id, serde_json::to_value(manifest())?)).await?;
            }
            METHOD_EXECUTE => {
                let params: ExecuteParams = match serde_json::from_value(params) {
                    Ok(p) => p,
                    Err(e) => {
                        let reply = Message::error_response(id, ERROR_INVALID_PARAMS, e.to_string());
                        send(&mut stdout, &reply).await?;
                        continue;
                    }
                };
                let log = Message::notification(
                    METHOD_LOG,
                    json!({
                        "level": "info",
                        "message": format!("executing {}", params.operation),
                        "data": {"operation": params.operation, "workdir": params.context.workdir}
                    }),
                );
                send(&mut stdout, &log).await?;
                let result = execute(&params);
                send(&mut stdout, &Message::response(id, serde_json::to_value(result)?)).await?;
            }
            METHOD_SHUTDOWN => {
                if ignore_shutdown {
                    continue;
                }
                send(&mut stdout, &Message::response(id, Value::Null)).await?;
                if hang_on_shutdown {
                    std::future::pending::<()>().await;
                }
                return Ok(());
            }
            other => {
                let reply =
                    Message::error_response(id, ERROR_METHOD_NOT_FOUND, format!("unknown method {}", other));
                send(&mut stdout, &reply).await?;
            }
        }
    }

    Ok(())
}
