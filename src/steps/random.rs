//! Per-task random values for `{random.*}` placeholders.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use rand::RngExt;

use super::template::{SourceResolver, TemplateError};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LENGTH: usize = 8;

/// Generates `id` and `port` on first use and returns the same value for the
/// rest of the task, so setup, verify and cleanup agree on e.g. a namespace
/// name.
#[derive(Debug, Default)]
pub struct RandomResolver {
    values: Mutex<HashMap<String, String>>,
}

impl RandomResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate(field: &str) -> Result<String, TemplateError> {
        match field {
            "id" => Ok(random_id()),
            "port" => free_port().map(|p| p.to_string()),
            other => Err(TemplateError::UnknownRandomField(other.to_string())),
        }
    }
}

impl SourceResolver for RandomResolver {
    fn resolve(&self, field: &str) -> Result<String, TemplateError> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(v) = values.get(field) {
            return Ok(v.clone());
        }

        let value = Self::generate(field)?;
        values.insert(field.to_string(), value.clone());
        Ok(value)
    }
}

fn random_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Asks the OS for an unused local port. The listener is dropped right away,
/// so the port is only very likely (not guaranteed) to still be free.
fn free_port() -> Result<u16, TemplateError> {
    let err = |e: std::io::Error| TemplateError::Random {
        field: "port".to_string(),
        reason: e.to_string(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").map_err(err)?;
    let port = listener.local_addr().map_err(err)?.port();
    Ok(port)
}
