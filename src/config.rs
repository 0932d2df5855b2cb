//! Engine configuration
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "data_dir": "./data",
//!   "engine": "file",
//!   "sync_mode": "fsync",
//!   "log_events": true,
//!   "trace_capacity": 1024
//! }
//! ```
//!
//! Only `data_dir` is required, and only for the file engine.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::{CliError, CliResult};
use crate::upgrade::DEFAULT_TRACE_CAPACITY;

/// Which storage engine backs the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// One durable image file per store
    #[default]
    File,
    /// Process-local, lost on exit
    Memory,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory (required for the file engine)
    #[serde(default)]
    pub data_dir: String,

    /// Storage engine (optional, default "file")
    #[serde(default)]
    pub engine: EngineKind,

    /// Sync mode (optional, default "fsync")
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,

    /// Write lifecycle events to the log (optional, default true)
    #[serde(default = "default_log_events")]
    pub log_events: bool,

    /// Protocol trace records kept in memory; 0 disables the trace
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,
}

fn default_sync_mode() -> String {
    "fsync".to_string()
}

fn default_log_events() -> bool {
    true
}

fn default_trace_capacity() -> usize {
    DEFAULT_TRACE_CAPACITY
}

impl EngineConfig {
    /// Load and validate configuration from a file.
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> CliResult<Self> {
        let config: EngineConfig = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration with logging off.
    pub fn in_memory() -> Self {
        Self {
            data_dir: String::new(),
            engine: EngineKind::Memory,
            sync_mode: default_sync_mode(),
            log_events: false,
            trace_capacity: default_trace_capacity(),
        }
    }

    /// File-engine configuration rooted at `data_dir`.
    pub fn file(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            engine: EngineKind::File,
            sync_mode: default_sync_mode(),
            log_events: true,
            trace_capacity: default_trace_capacity(),
        }
    }

    /// Disable or enable event logging.
    pub fn with_log_events(mut self, log_events: bool) -> Self {
        self.log_events = log_events;
        self
    }

    /// Set how many protocol trace records are kept.
    pub fn with_trace_capacity(mut self, trace_capacity: usize) -> Self {
        self.trace_capacity = trace_capacity;
        self
    }

    /// Validate field values.
    pub fn validate(&self) -> CliResult<()> {
        if self.sync_mode != "fsync" {
            return Err(CliError::config_error(format!(
                "Invalid sync_mode: '{}'. Only 'fsync' is allowed.",
                self.sync_mode
            )));
        }
        if self.engine == EngineKind::File && self.data_dir.trim().is_empty() {
            return Err(CliError::config_error(
                "data_dir is required for the file engine",
            ));
        }
        Ok(())
    }

    /// Data directory as a path.
    pub fn data_path(&self) -> &Path {
        Path::new(&self.data_dir)
    }

    /// Directory holding store image files.
    pub fn stores_path(&self) -> PathBuf {
        self.data_path().join("stores")
    }
}
