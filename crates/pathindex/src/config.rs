//! User settings persisted as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

pub const APP_DIR_NAME: &str = "everything-indexer";
pub const SETTINGS_FILENAME: &str = "settings.json";

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const MIN_DEBOUNCE_MS: u64 = 10;
pub const MAX_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_MAX_RESULTS: usize = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_JOURNAL_COMPACT_THRESHOLD: usize = 50_000;

/// Persisted indexer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Folders to crawl.
    pub roots: Vec<String>,
    /// Excluded folder prefixes.
    pub exclusions: Vec<String>,
    pub debounce_ms: u64,
    /// Upper bound on results delivered per search.
    pub max_results: usize,
    /// Results per delivered batch.
    pub batch_size: usize,
    pub case_sensitive: bool,
    /// Journal length that triggers a snapshot rewrite.
    pub journal_compact_threshold: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            exclusions: Vec::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_results: DEFAULT_MAX_RESULTS,
            batch_size: DEFAULT_BATCH_SIZE,
            case_sensitive: false,
            journal_compact_threshold: DEFAULT_JOURNAL_COMPACT_THRESHOLD,
        }
    }
}

impl IndexerConfig {
    /// Debounce window, clamped to a usable range.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS))
    }

    pub fn max_results(&self) -> usize {
        self.max_results.max(1)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Loads settings from `path`, writing defaults if the file is missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let data = std::fs::read_to_string(path).map_err(|error| {
            IndexError::StoreIo(format!(
                "failed to read settings {}: {error}",
                path.display()
            ))
        })?;
        serde_json::from_str(&data).map_err(|error| {
            IndexError::InvalidInput(format!(
                "failed to parse settings {}: {error}",
                path.display()
            ))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                IndexError::StoreIo(format!(
                    "failed to create settings directory {}: {error}",
                    parent.display()
                ))
            })?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|error| {
            IndexError::Serialization(format!("failed to serialize settings: {error}"))
        })?;
        std::fs::write(path, data).map_err(|error| {
            IndexError::StoreIo(format!(
                "failed to write settings {}: {error}",
                path.display()
            ))
        })
    }
}

/// Where settings and store files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Per-user locations (`<config_dir>/everything-indexer`, `<data_dir>/everything-indexer`).
    pub fn user_default() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| IndexError::Internal("no per-user config directory".to_string()))?;
        let data_dir = dirs::data_dir()
            .ok_or_else(|| IndexError::Internal("no per-user data directory".to_string()))?;
        Ok(Self::new(
            config_dir.join(APP_DIR_NAME),
            data_dir.join(APP_DIR_NAME),
        ))
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILENAME)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}
