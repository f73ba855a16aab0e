//! Shared error types for taskcheck.
//!
//! Each subsystem owns its error enum next to the code that produces it
//! (`StepError`, `ExtensionError`, `JudgeError`, ...). This module holds the
//! pieces that cut across them:
//! - [`ErrorList`], an aggregate of zero or more causes
//! - [`ConfigError`], raised while loading task and eval documents

use std::fmt;

use thiserror::Error;

/// An ordered collection of errors that were accumulated instead of
/// short-circuiting on the first one.
///
/// Display renders every cause on its own line.
#[derive(Debug)]
pub struct ErrorList<E> {
    errors: Vec<E>,
}

impl<E> Default for ErrorList<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E> ErrorList<E> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a cause.
    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    /// Appends the error of `result`, if any, and returns its success value.
    pub fn collect<T>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.errors.iter()
    }

    /// Consumes the list and returns the underlying causes.
    pub fn into_inner(self) -> Vec<E> {
        self.errors
    }

    /// `Ok(())` when nothing was collected, otherwise the list itself.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> FromIterator<E> for ErrorList<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl<E> IntoIterator for ErrorList<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<E: fmt::Display> fmt::Display for ErrorList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ErrorList<E> {}

/// Errors that can occur while loading task and eval documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document declares a different `kind`. Discovery treats this as
    /// "not for me" rather than a failure.
    #[error("wrong kind: got '{found}', expected '{expected}'")]
    WrongKind { found: String, expected: String },

    #[error("unknown apiVersion: '{0}'")]
    UnknownApiVersion(String),

    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// True when the document was skipped because it is some other kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, ConfigError::WrongKind { .. })
    }
}

/// Result alias for config loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
