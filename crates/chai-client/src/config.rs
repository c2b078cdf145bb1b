//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay address (`host:port`).
    pub relay_addr: String,
    /// Session token from the authentication component.
    pub session_token: String,
    /// Path to the client state database.
    pub storage_path: String,
    /// Signed prekey rotation period in days.
    pub rotation_days: i64,
    /// One-time prekeys uploaded per replenishment.
    pub replenish_batch: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_addr: "127.0.0.1:7700".into(),
            session_token: String::new(),
            storage_path: "chai-client.db".into(),
            rotation_days: 7,
            replenish_batch: 20,
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults if absent.
    pub fn load(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| ClientError::Storage(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
