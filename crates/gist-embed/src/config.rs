//! Configuration loading and resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{EmbedError, EmbedResult};

pub const DEFAULT_ENDPOINT: &str = "https://gist.github.com";
pub const DEFAULT_ASSET_BASE: &str = "https://gist-assets.github.com";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POLL_DURATION_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Settings for [`CallbackResolver`](crate::CallbackResolver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Content host; requests go to `<endpoint>/<identifier>.json`.
    pub endpoint: String,
    pub timeout_ms: u64,
    pub callback_prefix: String,
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            callback_prefix: "_gist_cb_".to_string(),
        }
    }
}

/// Settings for [`Activator`](crate::Activator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivatorConfig {
    /// Prefix for relative stylesheet paths.
    pub asset_base: String,
    pub complete_class: String,
    pub error_class: String,
    /// Restrict targets to one tag name (e.g. `code`). Any element when unset.
    pub target_tag: Option<String>,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            asset_base: DEFAULT_ASSET_BASE.to_string(),
            complete_class: "complete".to_string(),
            error_class: "error".to_string(),
            target_tag: None,
        }
    }
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Bounds for the polling trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollOptions {
    pub duration_ms: u64,
    pub interval_ms: u64,
}

impl PollOptions {
    pub fn new(duration: Duration, interval: Duration) -> Self {
        Self {
            duration_ms: saturating_millis(duration),
            interval_ms: saturating_millis(interval),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on the number of checks a poll performs.
    pub fn max_checks(&self) -> EmbedResult<u64> {
        if self.interval_ms == 0 {
            return Err(EmbedError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(self.duration_ms.div_ceil(self.interval_ms))
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_POLL_DURATION_MS,
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Settings for the inline-script bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Substring of the script `src` that identifies the embedder.
    pub script_marker: String,
    /// Script attribute naming the target data attribute.
    pub attribute: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            script_marker: "gister".to_string(),
            attribute: "data-attr-name".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub resolver: ResolverConfig,
    pub activator: ActivatorConfig,
    pub poll: PollOptions,
    pub bootstrap: BootstrapConfig,
}

impl EmbedConfig {
    /// Load the configuration file, falling back to defaults, then apply
    /// environment overrides.
    pub fn load(explicit: Option<&str>) -> EmbedResult<Self> {
        let mut config = match resolve_config_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EmbedResult<Self> {
        tracing::debug!("Loading config: {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn apply_env(&mut self) -> EmbedResult<()> {
        if let Ok(endpoint) = std::env::var("GIST_EMBED_ENDPOINT") {
            self.resolver.endpoint = endpoint;
        }
        if let Ok(timeout) = std::env::var("GIST_EMBED_TIMEOUT_MS") {
            self.resolver.timeout_ms = timeout.parse().map_err(|e| {
                EmbedError::Config(format!("GIST_EMBED_TIMEOUT_MS={timeout}: {e}"))
            })?;
        }
        Ok(())
    }
}

/// Resolve the config file path.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var("GIST_EMBED_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from(".gist-embed.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    None
}
