//! Session configuration.
//!
//! This module handles loading and saving the session configuration: where
//! the session fragment is stored, how the identity service is reached, and
//! the refresh policy.
//!
//! Configuration is stored at `~/.config/agentdesk/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::DEFAULT_SESSION_KEY;
use crate::storage::{FileBackend, KeyringBackend, MemoryBackend, SharedStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "agentdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Access tokens are issued for 30 minutes.
const DEFAULT_ACCESS_LIFETIME_SECS: u64 = 30 * 60;

/// Refresh 5 minutes before the access token would expire.
const DEFAULT_REFRESH_BUFFER_SECS: u64 = 5 * 60;

/// Wait between attempts after a failed refresh.
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 30;

/// Consecutive transient refresh failures tolerated before logging out.
/// Three attempts 30s apart ride out a brief outage while still ending the
/// session well before the access token expires.
const DEFAULT_MAX_REFRESH_FAILURES: u32 = 3;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    File,
    Keyring,
    Memory,
}

impl StorageMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(StorageMode::File),
            "keyring" => Some(StorageMode::Keyring),
            "memory" => Some(StorageMode::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_key: String,
    pub identity_url: Option<String>,
    pub storage: StorageMode,
    pub access_token_lifetime_secs: u64,
    pub refresh_buffer_secs: u64,
    pub retry_interval_secs: u64,
    pub max_refresh_failures: u32,
    pub request_timeout_secs: u64,
    pub external_poll_interval_ms: u64,
    pub last_email: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.to_string(),
            identity_url: None,
            storage: StorageMode::default(),
            access_token_lifetime_secs: DEFAULT_ACCESS_LIFETIME_SECS,
            refresh_buffer_secs: DEFAULT_REFRESH_BUFFER_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            max_refresh_failures: DEFAULT_MAX_REFRESH_FAILURES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            external_poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            last_email: None,
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Open the shared store for the configured storage mode.
    pub fn open_store(&self) -> Result<Arc<SharedStore>> {
        let store = match self.storage {
            StorageMode::File => {
                let backend = FileBackend::new(self.cache_dir()?.join("storage"));
                debug!(dir = %backend.dir().display(), "Using file storage");
                SharedStore::new(backend)
            }
            StorageMode::Keyring => SharedStore::new(KeyringBackend::new()),
            StorageMode::Memory => SharedStore::new(MemoryBackend::new()),
        };
        Ok(store)
    }

    pub fn access_token_lifetime(&self) -> chrono::Duration {
        seconds_or(self.access_token_lifetime_secs, DEFAULT_ACCESS_LIFETIME_SECS)
    }

    pub fn refresh_buffer(&self) -> chrono::Duration {
        // A buffer longer than the lifetime would refresh in a tight loop
        let lifetime = self.access_token_lifetime().num_seconds().unsigned_abs();
        let buffer = self.refresh_buffer_secs.min(lifetime / 2);
        seconds_or(buffer, DEFAULT_REFRESH_BUFFER_SECS)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn external_poll_interval(&self) -> Duration {
        Duration::from_millis(self.external_poll_interval_ms.max(50))
    }
}

/// `secs` as a chrono duration, or `fallback` if it is out of range.
fn seconds_or(secs: u64, fallback: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(|| chrono::Duration::seconds(fallback as i64))
}
