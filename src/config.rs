//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default manager endpoint, shared by daemon, clients and services.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8080";

/// Environment variable overriding the manager endpoint for clients and
/// services.
pub const ENDPOINT_ENV: &str = "KILN_ENDPOINT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the daemon listens on.
    pub listen: String,

    /// Scheduler poll interval in milliseconds.
    pub scheduler_tick_ms: u64,

    /// Maximum number of sessions returned by `list_session`.
    pub session_list_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_ENDPOINT.to_string(),
            scheduler_tick_ms: 1,
            session_list_limit: 10,
        }
    }
}

/// Manager address for client-side code: `KILN_ENDPOINT` or the default.
pub fn manager_endpoint() -> String {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the given config file, falling back to defaults (with a warning)
/// when it is absent or malformed. No path means plain defaults.
pub fn load_or_default(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };
    match load(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "config load failed, using defaults");
            Config::default()
        }
    }
}

/// Atomically write a config file (temp file + rename).
pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| write_err(e.to_string()))?;
            dir
        }
        _ => Path::new("."),
    };

    let contents =
        toml::to_string_pretty(config).map_err(|e| write_err(e.to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_err(e.to_string()))?;
    fs::write(temp.path(), contents.as_bytes()).map_err(|e| write_err(e.to_string()))?;
    temp.persist(path).map_err(|e| write_err(e.to_string()))?;
    Ok(())
}
