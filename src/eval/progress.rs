//! Progress events emitted while an evaluation runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::runner::EvalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    SetupStart,
    SetupStep,
    SetupComplete,
    EvalStart,
    TaskStart,
    TaskSetup,
    TaskRunning,
    TaskVerifying,
    TaskAssertions,
    TaskComplete,
    TaskError,
    EvalComplete,
}

impl ProgressEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupStart => "setup_start",
            Self::SetupStep => "setup_step",
            Self::SetupComplete => "setup_complete",
            Self::EvalStart => "eval_start",
            Self::TaskStart => "task_start",
            Self::TaskSetup => "task_setup",
            Self::TaskRunning => "task_running",
            Self::TaskVerifying => "task_verifying",
            Self::TaskAssertions => "task_assertions",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::EvalComplete => "eval_complete",
        }
    }
}

impl fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress update. `task` is the result of the task the event is
/// about, as filled in so far.
#[derive(Debug, Clone)]
pub struct ProgressEvent<'a> {
    pub event_type: ProgressEventType,
    pub message: String,
    pub task: Option<&'a EvalResult>,
    /// Set on `EvalStart`.
    pub total_tasks: usize,
    /// Set on `SetupStart`.
    pub total_steps: usize,
}

impl<'a> ProgressEvent<'a> {
    pub fn new(event_type: ProgressEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            task: None,
            total_tasks: 0,
            total_steps: 0,
        }
    }

    pub fn for_task(event_type: ProgressEventType, message: impl Into<String>, task: &'a EvalResult) -> Self {
        Self {
            task: Some(task),
            ..Self::new(event_type, message)
        }
    }

    pub fn with_total_tasks(mut self, total: usize) -> Self {
        self.total_tasks = total;
        self
    }

    pub fn with_total_steps(mut self, total: usize) -> Self {
        self.total_steps = total;
        self
    }
}

/// Receives progress events. Events of different tasks may arrive
/// interleaved, so implementations must synchronize internally.
pub trait ProgressCallback: Send + Sync {
    fn on_event(&self, event: &ProgressEvent<'_>);
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent<'_>) {
        self(event)
    }
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_event(&self, _event: &ProgressEvent<'_>) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_event(&self, event: &ProgressEvent<'_>) {
        match event.event_type {
            ProgressEventType::TaskError => {
                let error = event.task.map(|t| t.task_error.as_str()).unwrap_or_default();
                tracing::warn!(event = %event.event_type, error, "{}", event.message);
            }
            ProgressEventType::EvalStart => {
                tracing::info!(event = %event.event_type, total_tasks = event.total_tasks, "{}", event.message);
            }
            ProgressEventType::TaskComplete | ProgressEventType::EvalComplete => {
                tracing::info!(event = %event.event_type, "{}", event.message);
            }
            _ => tracing::debug!(event = %event.event_type, "{}", event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            serde_json::to_value(ProgressEventType::TaskAssertions).unwrap(),
            "task_assertions"
        );
        assert_eq!(ProgressEventType::EvalComplete.to_string(), "eval_complete");
    }

    #[test]
    fn test_closure_callback() {
        let seen = std::sync::Mutex::new(Vec::new());
        let callback = |e: &ProgressEvent<'_>| seen.lock().unwrap().push(e.event_type);
        callback.on_event(&ProgressEvent::new(ProgressEventType::EvalStart, "Starting evaluation").with_total_tasks(3));
        assert_eq!(*seen.lock().unwrap(), vec![ProgressEventType::EvalStart]);
    }
}
