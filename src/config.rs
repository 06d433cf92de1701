//! TOML configuration for uploadbench.
//!
//! Layered model: compiled-in defaults, overridden by a config file found via
//! the `UPLOADBENCH_CONFIG` environment variable or the standard system path.
//! CLI flags override both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::upload::payload::DEFAULT_PAYLOAD_SIZE;
use crate::upload::{ConnectionSettings, TimeoutPolicy, UPLOAD_PACKET};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "UPLOADBENCH_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/uploadbench/uploadbench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UploadConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded uploadbench configuration");
        Ok(config)
    }

    /// Try, in order: `$UPLOADBENCH_CONFIG`, the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "UPLOADBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Benchmark parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    /// Default server (`host:port`) when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Number of concurrent connections.
    pub threads: usize,
    /// Per-connection connect/stall deadline (milliseconds).
    pub timeout_ms: u64,
    /// Bytes queued per write.
    pub chunk_size: usize,
    /// Virtual payload size announced in the `UPLOAD` request line.
    pub payload_size: u64,
    /// What the per-connection deadline bounds.
    pub timeout_policy: TimeoutPolicy,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            server: None,
            threads: 4,
            timeout_ms: 5000,
            chunk_size: UPLOAD_PACKET,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            timeout_policy: TimeoutPolicy::ConnectAndStall,
        }
    }
}

impl UploadSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Connection settings for the engine. A zero chunk size is bumped to one
    /// byte so a connection always makes progress.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            timeout: self.timeout(),
            chunk_size: self.chunk_size.max(1),
            payload_size: self.payload_size,
            policy: self.timeout_policy,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
