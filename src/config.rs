//! Manager settings.
//!
//! Settings come from built-in defaults, then an optional TOML file, then a
//! handful of environment variables. Relative paths are resolved against
//! `base_dir`, which defaults to the platform data directory
//! (`~/.local/share/moduledepot` on Linux).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENVATO_API_URL: &str = "https://api.envato.com/v3";

const MIN_HTTP_TIMEOUT_SECS: u64 = 30;
const MAX_HTTP_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub base_dir: PathBuf,
    pub modules_dir: PathBuf,
    /// Holds `module_temp/`, `module_backups/`, `module_downloads/` and `feed_cache/`.
    pub storage_dir: PathBuf,
    pub registry_path: PathBuf,
    pub licenses_path: PathBuf,
    /// Published assets live in `<assets_dir>/<kebab-case module name>`.
    pub assets_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketplace_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envato_api_token: Option<String>,
    pub envato_api_url: String,
    pub run_seeders: bool,
    pub enable_auto_updates: bool,
    pub license_verification_interval_days: u32,
    pub http_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    /// Program and leading arguments for the external task runner.
    pub command_program: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            modules_dir: PathBuf::from("Modules"),
            storage_dir: PathBuf::from("storage/app"),
            registry_path: PathBuf::from("modules_statuses.json"),
            licenses_path: PathBuf::from("storage/app/module_licenses.json"),
            assets_dir: PathBuf::from("public/modules"),
            marketplace_url: None,
            envato_api_token: None,
            envato_api_url: DEFAULT_ENVATO_API_URL.to_string(),
            run_seeders: false,
            enable_auto_updates: true,
            license_verification_interval_days: 30,
            http_timeout_secs: 300,
            lock_timeout_secs: 10,
            command_program: vec!["php".to_string(), "artisan".to_string()],
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("moduledepot")
}

impl ManagerConfig {
    /// Defaults rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from an optional file, then apply environment overrides.
    ///
    /// `base_dir`, when given, wins over the value in the file.
    pub fn load(file: Option<&Path>, base_dir: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(base) = base_dir {
            config.base_dir = base.to_path_buf();
        }
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&contents).context(format!("Failed to parse config file: {:?}", path))
    }

    /// Write the settings file wholesale.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create config directory: {:?}", parent))?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))
    }

    /// Apply `MODULE_MARKETPLACE_URL`, `ENVATO_API_TOKEN`, `MODULE_RUN_SEEDERS`,
    /// `MODULE_AUTO_UPDATES` and `LICENSE_VERIFICATION_INTERVAL`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("MODULE_MARKETPLACE_URL") {
            self.marketplace_url = non_empty(url);
        }
        if let Some(token) = lookup("ENVATO_API_TOKEN") {
            self.envato_api_token = non_empty(token);
        }
        if let Some(flag) = lookup("MODULE_RUN_SEEDERS").and_then(|v| parse_bool(&v)) {
            self.run_seeders = flag;
        }
        if let Some(flag) = lookup("MODULE_AUTO_UPDATES").and_then(|v| parse_bool(&v)) {
            self.enable_auto_updates = flag;
        }
        if let Some(days) = lookup("LICENSE_VERIFICATION_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            self.license_verification_interval_days = days;
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.resolve(&self.modules_dir)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.resolve(&self.registry_path)
    }

    pub fn licenses_path(&self) -> PathBuf {
        self.resolve(&self.licenses_path)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.resolve(&self.assets_dir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve(&self.storage_dir).join("module_temp")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.resolve(&self.storage_dir).join("module_backups")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.resolve(&self.storage_dir).join("module_downloads")
    }

    pub fn feed_cache_dir(&self) -> PathBuf {
        self.resolve(&self.storage_dir).join("feed_cache")
    }

    /// Deadline for downloads and API calls, kept within 30..=900 seconds.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(
            self.http_timeout_secs
                .clamp(MIN_HTTP_TIMEOUT_SECS, MAX_HTTP_TIMEOUT_SECS),
        )
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
