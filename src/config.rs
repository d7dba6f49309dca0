// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Manager configuration.
//!
//! Everything lives under one data directory (`~/.offline-vault` by default):
//! `config.json`, the metadata file and the downloads folder. A `config.json`
//! only needs the keys it wants to override.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::DEFAULT_STORAGE_BUFFER;

const DATA_DIR_NAME: &str = ".offline-vault";
const CONFIG_FILE: &str = "config.json";
const INSTANCE_LOCK_FILE: &str = "instance.lock";

/// Tunables for [`crate::OfflineManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Where downloaded files are written
    pub downloads_dir: PathBuf,
    /// Whole-table JSON metadata file
    pub metadata_file: PathBuf,
    /// Bytes per disk write
    pub chunk_size: usize,
    /// Free space that must remain after every write
    pub storage_buffer_bytes: u64,
    /// Chunks between progress reports
    pub progress_interval: u32,
    /// Chunks between forced free-space queries
    pub space_check_interval: u32,
    pub head_timeout_secs: u64,
    /// Longest wait for response headers or the next body frame
    pub request_timeout_secs: u64,
    /// How long `stop_all` waits for workers to exit
    pub shutdown_grace_ms: u64,
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

/// `~/.offline-vault`, or a relative `.offline-vault` without a home directory.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

impl ManagerConfig {
    /// Defaults with every path rooted in `dir`.
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            downloads_dir: dir.join("downloads"),
            metadata_file: dir.join("downloads.json"),
            chunk_size: 64 * 1024,
            storage_buffer_bytes: DEFAULT_STORAGE_BUFFER,
            progress_interval: 16,
            space_check_interval: 16,
            head_timeout_secs: 20,
            request_timeout_secs: 30,
            shutdown_grace_ms: 1000,
            event_capacity: 256,
        }
    }

    /// Location of `config.json` inside `data_dir`.
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    /// Lock file held by the manager that owns this data directory.
    ///
    /// Sits next to the metadata file, since that is what it protects.
    pub fn instance_lock_path(&self) -> PathBuf {
        self.metadata_file.with_file_name(INSTANCE_LOCK_FILE)
    }

    /// Load from the default data directory.
    pub fn load() -> Result<Self> {
        Self::load_from(&default_data_dir())
    }

    /// Load `config.json` from `data_dir`, falling back to defaults rooted there.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let path = Self::config_path(data_dir);
        let defaults = Self::with_data_dir(data_dir);
        if !path.exists() {
            return Ok(defaults);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let overrides: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        let Some(overrides) = overrides.as_object() else {
            bail!("Config file {:?} must contain a JSON object", path);
        };

        // Missing keys keep the defaults for this data dir, not the home dir
        let mut merged = serde_json::to_value(&defaults)?;
        if let Some(base) = merged.as_object_mut() {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }

        let config: Self = serde_json::from_value(merged)
            .with_context(|| format!("Invalid setting in config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to the default data directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&default_data_dir())
    }

    pub fn save_to(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create directory: {:?}", data_dir))?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(Self::config_path(data_dir), content)?;
        Ok(())
    }

    /// Reject settings that would stall or spin a transfer.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.progress_interval == 0 {
            bail!("progress_interval must be greater than zero");
        }
        if self.space_check_interval == 0 {
            bail!("space_check_interval must be greater than zero");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
