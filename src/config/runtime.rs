use super::SnampConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Runtime-tunable settings. Changes via PUT /api/admin/settings take effect
/// without restart: new update windows pick up the current duration, and the
/// reload loop checks `reload_enabled` on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub update_window_ms: u64,
    pub reload_enabled: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&SnampConfig::default())
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &SnampConfig) -> Self {
        Self {
            update_window_ms: config.update_window.duration_ms,
            reload_enabled: config.reload.enabled,
        }
    }

    /// Seed from `config`, then apply env var overrides.
    pub fn from_env(config: &SnampConfig) -> Self {
        let mut settings = Self::from_config(config);

        if let Ok(v) = std::env::var("SNAMP_UPDATE_WINDOW_MS") {
            if let Ok(n) = v.parse::<u64>() {
                settings.update_window_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SNAMP_RELOAD_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                settings.reload_enabled = b;
            }
        }

        settings
    }

    pub fn update_window(&self) -> Duration {
        Duration::from_millis(self.update_window_ms)
    }
}

pub type SharedRuntimeSettings = Arc<RwLock<RuntimeSettings>>;

pub fn new_runtime_settings(config: &SnampConfig) -> SharedRuntimeSettings {
    Arc::new(RwLock::new(RuntimeSettings::from_env(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_from_config() {
        let mut config = SnampConfig::default();
        config.update_window.duration_ms = 1234;
        config.reload.enabled = false;

        let settings = RuntimeSettings::from_config(&config);
        assert_eq!(settings.update_window(), Duration::from_millis(1234));
        assert!(!settings.reload_enabled);
    }
}
