pub mod runtime;
pub use runtime::{new_runtime_settings, RuntimeSettings, SharedRuntimeSettings};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete SNAMP host configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SnampConfig {
    #[serde(default)]
    pub update_window: UpdateWindowConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Update window timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateWindowConfig {
    /// Grace period after the last change before an update is applied
    #[serde(default = "default_window_duration_ms")]
    pub duration_ms: u64,
    /// How often the shared timer checks window deadlines
    #[serde(default = "default_timer_tick_ms")]
    pub timer_tick_ms: u64,
}

fn default_window_duration_ms() -> u64 {
    2000
}

fn default_timer_tick_ms() -> u64 {
    100
}

impl UpdateWindowConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms.max(1))
    }
}

impl Default for UpdateWindowConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_window_duration_ms(),
            timer_tick_ms: default_timer_tick_ms(),
        }
    }
}

/// Where the agent configuration is stored
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// File holding the agent configuration (.toml, .json or .json.gz)
    #[serde(default = "default_persistence_path")]
    pub path: PathBuf,
    /// Save the baseline after every applied change
    #[serde(default = "default_save_on_apply")]
    pub save_on_apply: bool,
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("/var/lib/snamp/agent.toml")
}

fn default_save_on_apply() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_persistence_path(),
            save_on_apply: default_save_on_apply(),
        }
    }
}

/// Periodic reload of the stored configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReloadConfig {
    #[serde(default = "default_reload_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reload_interval")]
    pub interval_seconds: u64,
}

fn default_reload_enabled() -> bool {
    true
}

fn default_reload_interval() -> u64 {
    5
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_reload_enabled(),
            interval_seconds: default_reload_interval(),
        }
    }
}

impl ReloadConfig {
    /// Polling interval, never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

/// HTTP inspection API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_port() -> u16 {
    3002
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<SnampConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let config: SnampConfig = toml::from_str(&contents).context("Failed to parse settings file")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SnampConfig::default();
        assert_eq!(config.update_window.duration_ms, 2000);
        assert_eq!(config.update_window.timer_tick_ms, 100);
        assert_eq!(config.persistence.path, PathBuf::from("/var/lib/snamp/agent.toml"));
        assert!(config.persistence.save_on_apply);
        assert!(config.reload.enabled);
        assert_eq!(config.reload.interval_seconds, 5);
        assert!(config.api.enabled);
        assert_eq!(config.api.port, 3002);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [update_window]
            duration_ms = 500
            timer_tick_ms = 20

            [persistence]
            path = "/tmp/agent.json.gz"
            save_on_apply = false

            [reload]
            enabled = false
            interval_seconds = 30

            [api]
            enabled = false
            port = 8080
        "#;

        let config: SnampConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.update_window.duration(), Duration::from_millis(500));
        assert_eq!(config.update_window.timer_tick(), Duration::from_millis(20));
        assert_eq!(config.persistence.path, PathBuf::from("/tmp/agent.json.gz"));
        assert!(!config.persistence.save_on_apply);
        assert!(!config.reload.enabled);
        assert_eq!(config.reload.interval_seconds, 30);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and keys use defaults
        let toml = r#"
            [update_window]
            duration_ms = 750
        "#;

        let config: SnampConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.update_window.duration_ms, 750);
        assert_eq!(config.update_window.timer_tick_ms, 100);
        assert!(config.reload.enabled);
        assert_eq!(config.api.port, 3002);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let config: SnampConfig = toml::from_str("[update_window]\ntimer_tick_ms = 0").unwrap();
        assert_eq!(config.update_window.timer_tick(), Duration::from_millis(1));

        let config: SnampConfig = toml::from_str("[reload]\ninterval_seconds = 0").unwrap();
        assert_eq!(config.reload.interval(), Duration::from_secs(1));
    }
}
