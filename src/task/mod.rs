//! Task documents and their execution.

pub mod config;
pub mod runner;

pub use config::{Requirement, TaskConfig, TaskMetadata, TaskSpec, KIND_TASK};
pub use runner::{
    AgentDetails, PhaseError, PhaseOutput, StepParseError, TaskDeps, TaskError, TaskRunner,
    AGENT_STEP_TYPE,
};
