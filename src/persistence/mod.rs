//! Persistence of the agent configuration.
//!
//! The file store picks its format from the path extension: `.toml`,
//! `.json` or `.json.gz`. Writes go to a temporary sibling first and are
//! renamed into place, so a reader never observes a partial file.

use crate::configuration::AgentConfiguration;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{debug, info};

#[cfg(test)]
mod tests;

/// Backing storage for the agent configuration.
pub trait ConfigurationStore: Send + Sync {
    /// Loads the stored configuration. An absent store yields an empty one.
    fn load(&self) -> Result<AgentConfiguration>;

    /// Replaces the stored configuration.
    fn save(&self, configuration: &AgentConfiguration) -> Result<()>;

    /// Last modification time, used by the reload loop to detect edits.
    fn modified_at(&self) -> Option<SystemTime> {
        None
    }
}

/// On-disk encoding of a configuration file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreFormat {
    Toml,
    Json,
    /// Gzip-compressed JSON
    JsonGz,
}

impl StoreFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if name.ends_with(".json.gz") {
            Ok(StoreFormat::JsonGz)
        } else if name.ends_with(".json") {
            Ok(StoreFormat::Json)
        } else if name.ends_with(".toml") {
            Ok(StoreFormat::Toml)
        } else {
            bail!(
                "Unsupported configuration file extension: {} (expected .toml, .json or .json.gz)",
                path.display()
            )
        }
    }

    fn encode(&self, configuration: &AgentConfiguration) -> Result<Vec<u8>> {
        match self {
            StoreFormat::Toml => {
                let text = toml::to_string_pretty(configuration)
                    .context("Failed to serialize configuration to TOML")?;
                Ok(text.into_bytes())
            }
            StoreFormat::Json => serde_json::to_vec_pretty(configuration)
                .context("Failed to serialize configuration to JSON"),
            StoreFormat::JsonGz => {
                let json = serde_json::to_vec(configuration)
                    .context("Failed to serialize configuration to JSON")?;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&json)
                    .context("Failed to write compressed configuration data")?;
                encoder.finish().context("Failed to finish compression")
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<AgentConfiguration> {
        match self {
            StoreFormat::Toml => {
                let text = std::str::from_utf8(bytes).context("Configuration file is not UTF-8")?;
                toml::from_str(text).context("Failed to parse TOML configuration")
            }
            StoreFormat::Json => {
                serde_json::from_slice(bytes).context("Failed to parse JSON configuration")
            }
            StoreFormat::JsonGz => {
                let mut json = String::new();
                GzDecoder::new(bytes)
                    .read_to_string(&mut json)
                    .context("Failed to decompress configuration file")?;
                serde_json::from_str(&json).context("Failed to parse JSON configuration")
            }
        }
    }
}

/// Configuration stored in a single file.
#[derive(Clone, Debug)]
pub struct FileConfigurationStore {
    path: PathBuf,
    format: StoreFormat,
}

impl FileConfigurationStore {
    /// Fails if the path extension names no supported format.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = StoreFormat::from_path(&path)?;
        Ok(Self { path, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigurationStore for FileConfigurationStore {
    fn load(&self) -> Result<AgentConfiguration> {
        if !self.path.exists() {
            info!(
                path = %self.path.display(),
                "Configuration file does not exist, starting with empty configuration"
            );
            return Ok(AgentConfiguration::default());
        }

        let mut bytes = Vec::new();
        File::open(&self.path)
            .context("Failed to open configuration file")?
            .read_to_end(&mut bytes)
            .context("Failed to read configuration file")?;

        let configuration = self
            .format
            .decode(&bytes)
            .with_context(|| format!("Invalid configuration file {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            entities = configuration.entity_count(),
            "Loaded configuration"
        );
        Ok(configuration)
    }

    fn save(&self, configuration: &AgentConfiguration) -> Result<()> {
        let bytes = self.format.encode(configuration)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let tmp_path = self.tmp_path();
        {
            let mut tmp_file =
                File::create(&tmp_path).context("Failed to create temporary configuration file")?;
            tmp_file
                .write_all(&bytes)
                .context("Failed to write configuration data")?;
            tmp_file
                .sync_all()
                .context("Failed to sync configuration file to disk")?;
        }

        fs::rename(&tmp_path, &self.path).context("Failed to rename temporary configuration file")?;

        debug!(
            path = %self.path.display(),
            size_bytes = bytes.len(),
            "Saved configuration"
        );
        Ok(())
    }

    fn modified_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Volatile store, mostly for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationStore {
    stored: RwLock<Option<(AgentConfiguration, SystemTime)>>,
}

impl InMemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configuration(configuration: AgentConfiguration) -> Self {
        Self {
            stored: RwLock::new(Some((configuration, SystemTime::now()))),
        }
    }
}

impl ConfigurationStore for InMemoryConfigurationStore {
    fn load(&self) -> Result<AgentConfiguration> {
        let stored = self.stored.read().unwrap_or_else(PoisonError::into_inner);
        Ok(stored
            .as_ref()
            .map(|(configuration, _)| configuration.clone())
            .unwrap_or_default())
    }

    fn save(&self, configuration: &AgentConfiguration) -> Result<()> {
        let mut stored = self.stored.write().unwrap_or_else(PoisonError::into_inner);
        *stored = Some((configuration.clone(), SystemTime::now()));
        Ok(())
    }

    fn modified_at(&self) -> Option<SystemTime> {
        let stored = self.stored.read().unwrap_or_else(PoisonError::into_inner);
        stored.as_ref().map(|(_, at)| *at)
    }
}
