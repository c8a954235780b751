//! Configuration for the acquisition pipeline.
//!
//! Settings resolve in three layers: built-in defaults, an optional TOML
//! config file, then environment variables (a `.env` file is honored via
//! dotenvy). The core treats all of this as read-only input.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::SourceId;

/// Default delay between requests to one source, in milliseconds.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 1000;
/// Default per-batch size for continuous mode.
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// Default seconds between continuous-mode batches.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Resolved application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory: raw downloads, extracted archives, credentials,
    /// and the catalog database all live under it.
    pub data_dir: PathBuf,
    /// Database filename within the data directory.
    pub database_filename: String,
    /// Request timeout in seconds for every network operation.
    pub request_timeout: u64,
    /// Default delay between requests to the same source, in milliseconds.
    pub request_delay_ms: u64,
    /// Search keywords applied at discovery.
    pub keywords: Vec<String>,
    /// Per-source configuration overrides.
    pub sources: HashMap<String, SourceConfig>,
}

/// Per-source overrides and credentials from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Disabled sources are skipped entirely.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Source-specific request delay in milliseconds.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Static API token (Sketchfab, GitHub).
    #[serde(default)]
    pub api_token: Option<String>,
    /// OAuth application id, seeding the credential file.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth application secret, seeding the credential file.
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vrmacquire");

        Self {
            data_dir,
            database_filename: "models.db".to_string(),
            request_timeout: 30,
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            keywords: Vec::new(),
            sources: HashMap::new(),
        }
    }
}

impl Settings {
    /// Full path to the catalog database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Downloaded artifacts root.
    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    /// Archive extraction root.
    pub fn extracted_dir(&self) -> PathBuf {
        self.data_dir.join("extracted")
    }

    /// OAuth credential files root.
    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    /// Ensure all data directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.raw_dir())?;
        fs::create_dir_all(self.extracted_dir())?;
        Ok(())
    }

    pub fn source_config(&self, source: SourceId) -> Option<&SourceConfig> {
        self.sources.get(source.as_str())
    }

    /// Sources default to enabled unless the config says otherwise.
    pub fn source_enabled(&self, source: SourceId) -> bool {
        self.source_config(source)
            .and_then(|c| c.enabled)
            .unwrap_or(true)
    }

    /// Effective inter-request delay for a source.
    pub fn source_delay(&self, source: SourceId) -> Duration {
        let ms = self
            .source_config(source)
            .and_then(|c| c.delay_ms)
            .unwrap_or(self.request_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data (tilde-expanded).
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename.
    #[serde(default)]
    pub database: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    /// Delay between requests in milliseconds.
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    /// Search keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Per-source configuration.
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
}

impl Config {
    /// Load configuration from an explicit path, or `vrmacquire.toml` in the
    /// working directory when present. Missing files mean defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from("vrmacquire.toml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = fs::read_to_string(&path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Apply file configuration on top of settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(delay) = self.request_delay_ms {
            settings.request_delay_ms = delay;
        }
        if !self.keywords.is_empty() {
            settings.keywords = self.keywords.clone();
        }
        for (source, config) in &self.sources {
            settings.sources.insert(source.clone(), config.clone());
        }
    }
}

/// Environment overrides, applied after the config file. A `.env` file in
/// the working directory is loaded first.
pub fn apply_env(settings: &mut Settings) {
    dotenvy::dotenv().ok();

    if let Ok(dir) = std::env::var("DATA_DIR") {
        settings.data_dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
    }
    if let Ok(delay) = std::env::var("RATE_LIMIT_DELAY_MS") {
        if let Ok(ms) = delay.parse() {
            settings.request_delay_ms = ms;
        }
    }
    if let Ok(token) = std::env::var("SKETCHFAB_API_TOKEN") {
        settings
            .sources
            .entry(SourceId::Sketchfab.as_str().to_string())
            .or_default()
            .api_token = Some(token);
    }
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        settings
            .sources
            .entry(SourceId::GitHub.as_str().to_string())
            .or_default()
            .api_token = Some(token);
    }
}

/// Load settings: defaults, then config file, then environment.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let config = Config::load(config_path)?;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    apply_env(&mut settings);
    Ok(settings)
}
