//! Configuration loading and service URL resolution
//!
//! The engine never reads ambient mutable state from inside a worker: the
//! full configuration is resolved once at startup and passed into each job
//! by value.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable consulted when no CLI service URL is given
pub const SERVICE_URL_ENV: &str = "KARAOKE_SERVICE_URL";

/// Compiled-in default for the local separation service container
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8000";

/// Engine configuration value object
///
/// Passed by value into each background job at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the remote stem separation service
    pub service_url: String,
    /// Retries after the first attempt (R retries = R+1 total attempts)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Backoff cap, before jitter
    pub max_delay_ms: u64,
    /// External mixing tool binary (resolved via PATH when not absolute)
    pub ffmpeg_path: String,
    /// Output format requested from the separation service
    pub output_format: String,
    /// Output bitrate (kbps) requested from the separation service
    pub bitrate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            ffmpeg_path: "ffmpeg".to_string(),
            output_format: "mp3".to_string(),
            bitrate: 320,
        }
    }
}

impl EngineConfig {
    /// Load configuration following the standard priority order:
    /// 1. Explicit config file path (command-line argument, highest priority)
    /// 2. Platform config file (`<config dir>/karaoke/config.toml`)
    /// 3. Compiled defaults (fallback)
    ///
    /// After loading, the service URL itself can still be overridden by a
    /// CLI argument or the `KARAOKE_SERVICE_URL` environment variable via
    /// [`resolve_service_url`].
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = default_config_file() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Parse configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges before any job is constructed
    pub fn validate(&self) -> Result<()> {
        if self.service_url.is_empty() {
            return Err(Error::Config("service_url must not be empty".to_string()));
        }
        if self.base_delay_ms == 0 {
            return Err(Error::Config("base_delay_ms must be positive".to_string()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the service URL following the priority order:
/// 1. Command-line argument (highest priority)
/// 2. `KARAOKE_SERVICE_URL` environment variable
/// 3. Value from the loaded config file
pub fn resolve_service_url(cli_arg: Option<&str>, config: &EngineConfig) -> String {
    if let Some(url) = cli_arg {
        return url.to_string();
    }

    if let Ok(url) = std::env::var(SERVICE_URL_ENV) {
        if !url.is_empty() {
            return url;
        }
    }

    config.service_url.clone()
}

/// Platform config file path (`~/.config/karaoke/config.toml` on Linux)
fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("karaoke").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
}
