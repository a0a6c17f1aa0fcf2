//! Persistence for user preferences (`config.json`).
//!
//! Resolves to `<config dir>/sigil/config.json` (`~/.config/sigil/` on Linux,
//! `~/Library/Application Support/sigil/` on macOS). A missing or invalid file
//! yields defaults. `SIGIL_REGISTRY_URLS` (comma-separated) overrides the
//! configured registry candidates.

use crate::dispatcher::DuplicatePolicy;
use crate::feedback::DEFAULT_FLASH_MS;
use crate::registry::Schema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Environment variable overriding [`Config::registry_urls`].
pub const REGISTRY_URLS_ENV: &str = "SIGIL_REGISTRY_URLS";

/// User preferences (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry candidates tried in order; empty means the built-in list
    pub registry_urls: Vec<String>,
    /// Base that relative candidates resolve against
    pub base_url: Option<String>,
    /// Field aliases for registry records
    #[serde(flatten)]
    pub schema: Schema,
    pub duplicate_policy: DuplicatePolicy,
    /// How long a flashed element keeps its hit class
    pub flash_ms: u64,
    /// Hook namespaces declared before stubs install, besides `vault`
    pub namespaces: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_urls: Vec::new(),
            base_url: None,
            schema: Schema::default(),
            duplicate_policy: DuplicatePolicy::default(),
            flash_ms: DEFAULT_FLASH_MS,
            namespaces: Vec::new(),
        }
    }
}

impl Config {
    /// Parsed [`Config::base_url`]. An unparseable value is logged and ignored.
    pub fn base_url(&self) -> Option<Url> {
        let raw = self.base_url.as_deref()?;
        match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(base_url = raw, "ignoring invalid base_url: {e}");
                None
            }
        }
    }

    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }

    /// Replace `registry_urls` with the comma-separated `value`, if it lists
    /// anything.
    fn override_registry_urls(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        let urls: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect();
        if !urls.is_empty() {
            self.registry_urls = urls;
        }
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sigil"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Where [`load_config`] reads from and [`save_config`] writes to.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

/// Load config from disk with environment overrides applied.
pub fn load_config() -> Config {
    let mut config = match config_path() {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    };
    config.override_registry_urls(std::env::var(REGISTRY_URLS_ENV).ok().as_deref());
    config
}

/// Save config to disk.
pub fn save_config(config: &Config) -> Result<(), std::io::Error> {
    let path = config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &path)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers (used by public API and tests)
// ---------------------------------------------------------------------------

fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("invalid config {}: {e}, using defaults", path.display());
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}

fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
