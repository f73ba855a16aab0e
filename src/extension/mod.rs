//! Out-of-process extensions.
//!
//! An extension is a separate binary that exposes named operations over
//! JSON-RPC on its stdin/stdout. [`ExtensionClient`] owns one such process;
//! [`ExtensionManager`] starts them lazily by alias and stops them all at the
//! end of a run.

pub mod client;
pub mod connection;
pub mod manager;
pub mod protocol;

pub use client::{ExtensionClient, ExtensionOptions, ExtensionState, SHUTDOWN_RPC_TIMEOUT};
pub use manager::{ExtensionManager, ExtensionRef};

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorList;

/// Errors from extension processes and their protocol.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("failed to start extension '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to get {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to initialize extension: {0}")]
    Initialize(#[source] Box<ExtensionError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("extension returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("connection to extension closed")]
    ConnectionClosed,

    #[error("extension call timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("extension '{alias}' is not ready (state: {state})")]
    NotReady { alias: String, state: ExtensionState },

    #[error("extension process exited with {0}")]
    ProcessExit(String),

    #[error("failed to kill extension process: {0}")]
    Kill(String),

    #[error("extension '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("extension '{0}' is not registered")]
    NotRegistered(String),

    #[error("failed to start extension '{alias}': {source}")]
    Start {
        alias: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("{0}")]
    Joined(ErrorList<ExtensionError>),
}

impl ExtensionError {
    /// Flattens joined errors into their individual causes.
    pub fn causes(&self) -> Vec<&ExtensionError> {
        match self {
            ExtensionError::Joined(list) => list.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }

    /// Builds a joined error, or returns the single cause unchanged.
    pub fn join(list: ErrorList<ExtensionError>) -> Option<ExtensionError> {
        match list.len() {
            0 => None,
            1 => list.into_inner().pop(),
            _ => Some(ExtensionError::Joined(list)),
        }
    }
}
