//! Process-level runtime configuration.
//!
//! This covers how the process runs (paths, addresses, timeouts); the
//! replicated cluster membership lives in the data directory and in
//! the log itself (`raft::cluster`).

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// Runtime configuration for a replicated log node
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// URL peers use to reach this node
    pub url: String,
    /// Bootstrap a fresh single-node cluster on first start
    pub bootstrap: bool,
    /// Network address for metrics collection
    pub metrics_addr: String,
    /// Base path for data storage
    pub data_path: String,
    /// Leader heartbeat cadence in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// Base election timeout in milliseconds (jitter is added on top)
    pub election_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Creates a new RuntimeConfig with default values
    pub fn new() -> Self {
        RuntimeConfig {
            url: "http://127.0.0.1:4000".to_string(),
            bootstrap: false,
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_path: "./data".to_string(),
            heartbeat_timeout_ms: 50,
            election_timeout_ms: 150,
        }
    }

    /// Loads configuration from a TOML file, falling back to defaults
    /// when the file is missing or malformed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("node config {} unreadable ({}), using defaults", path, e);
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!("node config {} invalid ({}), using defaults", path, e);
                return Some(RuntimeConfig::new());
            }
        };
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }
}
