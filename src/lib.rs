//! taskcheck: run AI agents against declarative tasks and verify what they
//! did.
//!
//! An eval file names an agent, the MCP servers and extensions it may use,
//! and sets of task files. Each task runs through setup, the agent, verify
//! and cleanup; the steps of each phase are declarative (`script`, `http`,
//! `llmJudge`, or an operation of an extension).

pub mod agent;
pub mod cli;
pub mod error;
pub mod eval;
pub mod extension;
pub mod judge;
pub mod mcp;
pub mod meta;
pub mod steps;
pub mod task;

pub use error::{ConfigError, ErrorList};
pub use eval::{EvalError, EvalResult, EvalRunner, EvalSpec};
pub use task::{TaskConfig, TaskRunner};
