//! Talks to the `demo-extension` binary over stdio.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use taskcheck::extension::protocol::{ExecuteContext, ExecuteParams};
use taskcheck::extension::{
    ExtensionClient, ExtensionError, ExtensionManager, ExtensionOptions, ExtensionRef, ExtensionState,
};
use taskcheck::judge::JudgeBackend;
use taskcheck::steps::{
    RandomResolver, Registry, StepConfig, StepError, StepInput, StepOutputs, StepRunner,
};

const DEMO: &str = env!("CARGO_BIN_EXE_demo-extension");

fn demo_ref() -> ExtensionRef {
    ExtensionRef {
        command: DEMO.to_string(),
        ..Default::default()
    }
}

fn manager() -> Arc<ExtensionManager> {
    let mut manager = ExtensionManager::new(std::env::temp_dir());
    manager.register("demo", demo_ref()).unwrap();
    Arc::new(manager)
}

fn execute_params(operation: &str, args: serde_json::Value) -> ExecuteParams {
    ExecuteParams {
        operation: operation.to_string(),
        args,
        context: ExecuteContext {
            workdir: "/tmp".to_string(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            agent: None,
        },
    }
}

#[tokio::test]
async fn test_client_lifecycle() {
    let cancel = CancellationToken::new();
    let mut client = ExtensionClient::new("demo", ExtensionOptions::new(DEMO));
    client.start(&cancel).await.unwrap();

    assert_eq!(client.state(), ExtensionState::Ready);
    assert_eq!(client.manifest().name, "demo-extension");
    assert!(client.manifest().operations.contains_key("echo"));

    let echoed = client
        .execute(&cancel, &execute_params("echo", json!({"message": "hi"})))
        .await
        .unwrap();
    assert!(echoed.success);
    assert_eq!(echoed.outputs["message"], "hi");

    let env = client
        .execute(&cancel, &execute_params("env", json!({"name": "GREETING"})))
        .await
        .unwrap();
    assert_eq!(env.outputs["value"], "hello");

    let failed = client
        .execute(&cancel, &execute_params("fail", json!({})))
        .await
        .unwrap();
    assert!(!failed.success);
    assert_eq!(failed.error, "demo failure");

    client.shutdown(&cancel).await.unwrap();
    assert_eq!(client.state(), ExtensionState::Stopped);
    client.shutdown(&cancel).await.unwrap();
    assert_eq!(client.state(), ExtensionState::Stopped);

    let err = client
        .execute(&cancel, &execute_params("echo", json!({"message": "late"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::NotReady { .. }));
}

#[tokio::test]
async fn test_start_fails_for_missing_binary() {
    let mut client = ExtensionClient::new(
        "missing",
        ExtensionOptions::new("/nonexistent/taskcheck-extension"),
    );
    let err = client.start(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ExtensionError::Spawn { .. }));
}

#[tokio::test]
async fn test_shutdown_kills_extension_that_does_not_exit() {
    let mut client = ExtensionClient::new(
        "hang",
        ExtensionOptions::new(DEMO).with_env("DEMO_EXTENSION_HANG_ON_SHUTDOWN", "1"),
    );
    client.start(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(10), client.shutdown(&cancel))
        .await
        .expect("shutdown should return once cancelled")
        .unwrap_err();

    let causes = err.causes();
    assert!(
        causes.iter().any(|e| matches!(e, ExtensionError::Cancelled)),
        "unexpected error: {}",
        err
    );
    assert_eq!(client.state(), ExtensionState::Stopped);
}

#[tokio::test]
async fn test_shutdown_kills_extension_that_never_answers() {
    let mut client = ExtensionClient::new(
        "deaf",
        ExtensionOptions::new(DEMO).with_env("DEMO_EXTENSION_IGNORE_SHUTDOWN", "1"),
    );
    let cancel = CancellationToken::new();
    client.start(&cancel).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(15), client.shutdown(&cancel))
        .await
        .expect("shutdown should give up on the rpc")
        .unwrap_err();

    let causes = err.causes();
    assert!(
        causes.iter().any(|e| matches!(e, ExtensionError::Timeout(_))),
        "unexpected error: {}",
        err
    );
    assert_eq!(client.state(), ExtensionState::Stopped);

    client.shutdown(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_manager_starts_extension_once() {
    let manager = manager();
    let cancel = CancellationToken::new();

    let clients = join_all((0..4).map(|_| manager.get(&cancel, "demo"))).await;
    let clients: Vec<_> = clients.into_iter().map(Result::unwrap).collect();
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));

    let err = manager.get(&cancel, "unknown").await.unwrap_err();
    assert!(matches!(err, ExtensionError::NotRegistered(a) if a == "unknown"));

    manager.shutdown_all(&cancel).await.unwrap();
    assert_eq!(clients[0].state(), ExtensionState::Stopped);
}

#[tokio::test]
async fn test_manager_reports_start_failure() {
    let mut manager = ExtensionManager::new(std::env::temp_dir());
    manager
        .register(
            "broken",
            ExtensionRef {
                command: "/nonexistent/taskcheck-extension".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let err = manager
        .get(&CancellationToken::new(), "broken")
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::Start { ref alias, .. } if alias == "broken"));
}

struct StepEnv {
    cancel: CancellationToken,
    env: HashMap<String, String>,
    outputs: StepOutputs,
    random: RandomResolver,
}

impl StepEnv {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            env: HashMap::new(),
            outputs: StepOutputs::new(),
            random: RandomResolver::new(),
        }
    }

    fn input<'a>(&'a self, workdir: &'a Path) -> StepInput<'a> {
        StepInput {
            cancel: &self.cancel,
            workdir,
            env: &self.env,
            agent: None,
            step_outputs: &self.outputs,
            random: &self.random,
        }
    }
}

#[tokio::test]
async fn test_extension_steps_through_registry() {
    let manager = manager();
    let aliases = HashMap::from([("ext".to_string(), "demo".to_string())]);
    let registry = Registry::builtin(Arc::new(JudgeBackend::Noop)).with_extensions(&manager, &aliases);
    let ctx = StepEnv::new();
    let workdir = std::env::temp_dir();

    let step = registry
        .parse(&ctx.cancel, &StepConfig::new("ext.echo", json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(step.step_type(), "ext.echo");
    let output = step.execute(&ctx.input(&workdir)).await.unwrap();
    assert!(output.success);
    assert_eq!(output.step_type, "ext.echo");
    assert_eq!(output.outputs["message"], "hi");

    let fail = registry
        .parse(&ctx.cancel, &StepConfig::new("ext.fail", json!(null)))
        .await
        .unwrap();
    let output = fail.execute(&ctx.input(&workdir)).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.error, "demo failure");

    let err = registry
        .parse(&ctx.cancel, &StepConfig::new("ext.nope", json!({})))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StepError::InvalidConfig(ref m) if m.contains("not declared")));

    let err = registry
        .parse(&ctx.cancel, &StepConfig::new("ext.echo", json!({"message": 42})))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StepError::InvalidConfig(ref m) if m.contains("did not match params")));

    manager.shutdown_all(&ctx.cancel).await.unwrap();
}
