//! Configuration vault – reads/writes `~/.pilot/config.toml`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use pilot_inference::{BridgeConfig, ClientConfig, EndpointConfig};
use pilot_runtime::TaskManagerConfig;
use serde::{Deserialize, Serialize};

/// Persisted configuration stored in `~/.pilot/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the primary chat-completions endpoint.
    #[serde(default = "default_primary_url")]
    pub primary_url: String,

    /// Primary endpoint API key (stored as plain text – file permissions
    /// are restricted to the owner on save).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_api_key: String,

    /// Optional fallback endpoint tried after any primary failure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_url: String,

    /// Fallback endpoint API key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fallback_api_key: String,

    /// Model used for every fallback attempt, regardless of tier.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    /// Fast-tier model (reflex decisions, classification).
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Slow-tier model (multi-step planning, correction plans).
    #[serde(default = "default_slow_model")]
    pub slow_model: String,

    /// Fast-tier HTTP timeout, seconds.
    #[serde(default = "default_fast_timeout_secs")]
    pub fast_timeout_secs: u64,

    /// Slow-tier HTTP timeout, seconds.
    #[serde(default = "default_slow_timeout_secs")]
    pub slow_timeout_secs: u64,

    /// Outbound inference quota per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Goal-arbitration hysteresis margin, in priority-weight units.
    #[serde(default = "default_hysteresis_margin")]
    pub hysteresis_margin: u32,

    /// Attempts per task step before correction is requested.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Control loop tick interval, milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("primary_url", &self.primary_url)
            .field(
                "primary_api_key",
                if self.primary_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("fallback_url", &self.fallback_url)
            .field(
                "fallback_api_key",
                if self.fallback_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("fallback_model", &self.fallback_model)
            .field("fast_model", &self.fast_model)
            .field("slow_model", &self.slow_model)
            .field("fast_timeout_secs", &self.fast_timeout_secs)
            .field("slow_timeout_secs", &self.slow_timeout_secs)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("hysteresis_margin", &self.hysteresis_margin)
            .field("max_attempts", &self.max_attempts)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .finish()
    }
}

fn default_primary_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_fallback_model() -> String {
    "pilot-fallback".to_string()
}
fn default_fast_model() -> String {
    "pilot-fast".to_string()
}
fn default_slow_model() -> String {
    "pilot-slow".to_string()
}
fn default_fast_timeout_secs() -> u64 {
    10
}
fn default_slow_timeout_secs() -> u64 {
    45
}
fn default_requests_per_minute() -> u32 {
    30
}
fn default_hysteresis_margin() -> u32 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_tick_interval_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            primary_api_key: String::new(),
            fallback_url: String::new(),
            fallback_api_key: String::new(),
            fallback_model: default_fallback_model(),
            fast_model: default_fast_model(),
            slow_model: default_slow_model(),
            fast_timeout_secs: default_fast_timeout_secs(),
            slow_timeout_secs: default_slow_timeout_secs(),
            requests_per_minute: default_requests_per_minute(),
            hysteresis_margin: default_hysteresis_margin(),
            max_attempts: default_max_attempts(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Config {
    /// Client configuration for the inference worker.
    pub fn client_config(&self) -> ClientConfig {
        let fallback = if self.fallback_url.is_empty() {
            None
        } else {
            Some(EndpointConfig {
                base_url: self.fallback_url.clone(),
                api_key: non_empty(&self.fallback_api_key),
            })
        };
        ClientConfig {
            primary: EndpointConfig {
                base_url: self.primary_url.clone(),
                api_key: non_empty(&self.primary_api_key),
            },
            fallback,
            fallback_model: self.fallback_model.clone(),
        }
    }

    /// Bridge configuration with tier models and timeouts applied.
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut bridge = BridgeConfig::default();
        bridge.fast.model = self.fast_model.clone();
        bridge.fast.timeout = Duration::from_secs(self.fast_timeout_secs);
        bridge.slow.model = self.slow_model.clone();
        bridge.slow.timeout = Duration::from_secs(self.slow_timeout_secs);
        bridge.requests_per_minute = self.requests_per_minute;
        bridge
    }

    /// Task loop configuration.
    pub fn task_config(&self) -> TaskManagerConfig {
        TaskManagerConfig {
            max_attempts: self.max_attempts,
            ..TaskManagerConfig::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Return the path to `~/.pilot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pilot").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `PILOT_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `PILOT_PRIMARY_URL` | `primary_url` |
/// | `PILOT_FALLBACK_URL` | `fallback_url` |
/// | `PILOT_FAST_MODEL` | `fast_model` |
/// | `PILOT_SLOW_MODEL` | `slow_model` |
/// | `PILOT_REQUESTS_PER_MINUTE` | `requests_per_minute` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PILOT_PRIMARY_URL") {
        cfg.primary_url = v;
    }
    if let Ok(v) = std::env::var("PILOT_FALLBACK_URL") {
        cfg.fallback_url = v;
    }
    if let Ok(v) = std::env::var("PILOT_FAST_MODEL") {
        cfg.fast_model = v;
    }
    if let Ok(v) = std::env::var("PILOT_SLOW_MODEL") {
        cfg.slow_model = v;
    }
    if let Ok(v) = std::env::var("PILOT_REQUESTS_PER_MINUTE")
        && let Ok(quota) = v.parse::<u32>() {
            cfg.requests_per_minute = quota;
        }
}

/// Save the config to disk, creating `~/.pilot/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
