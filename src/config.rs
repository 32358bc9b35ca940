//! TOML configuration for the tutor client.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, see [`load_config_or_default`]) yields a working configuration that
//! points at `http://localhost:8000`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl UploadConfig {
    /// Saturates at `u64::MAX` for absurdly large limits.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

fn default_max_file_size_mb() -> u64 {
    50
}
fn default_allowed_extensions() -> Vec<String> {
    vec![".pdf".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_topic")]
    pub default_topic: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            default_topic: default_topic(),
        }
    }
}

fn default_max_message_length() -> usize {
    1000
}
fn default_topic() -> String {
    "sound".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Lifetime of in-memory cached values. `0` disables the cache.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            prefix: default_prefix(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/tutor.sqlite")
}
fn default_prefix() -> String {
    "ai_tutor".to_string()
}
fn default_cache_ttl_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            max_buffered_events: default_max_buffered_events(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_max_buffered_events() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    #[serde(default = "default_images_dir")]
    pub dir: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            dir: default_images_dir(),
        }
    }
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("pics")
}

/// Output format of the stderr log layer.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to [`Config::default`].
///
/// A file that exists but fails to parse or validate is still an error.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate api
    let base = &config.api.base_url;
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!("api.base_url must start with http:// or https:// (got '{}')", base);
    }
    if config.api.timeout_secs == 0 {
        anyhow::bail!("api.timeout_secs must be > 0");
    }
    if config.api.retry_attempts == 0 {
        anyhow::bail!("api.retry_attempts must be >= 1");
    }

    // Validate upload
    if config.upload.max_file_size_mb == 0 {
        anyhow::bail!("upload.max_file_size_mb must be > 0");
    }
    if config.upload.allowed_extensions.is_empty() {
        anyhow::bail!("upload.allowed_extensions must list at least one extension");
    }

    if config.chat.max_message_length == 0 {
        anyhow::bail!("chat.max_message_length must be > 0");
    }

    // Validate storage
    if config.storage.prefix.is_empty() || config.storage.prefix.contains(':') {
        anyhow::bail!("storage.prefix must be non-empty and must not contain ':'");
    }

    if config.analytics.batch_size == 0 {
        anyhow::bail!("analytics.batch_size must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8000");
        assert_eq!(config.api.timeout_secs, 60);
        assert_eq!(config.api.retry_attempts, 3);
        assert_eq!(config.upload.max_file_size_mb, 50);
        assert_eq!(config.upload.allowed_extensions, vec![".pdf"]);
        assert_eq!(config.chat.max_message_length, 1000);
        assert_eq!(config.storage.prefix, "ai_tutor");
        assert_eq!(config.analytics.batch_size, 10);
        assert_eq!(config.analytics.flush_interval_secs, 30);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            base_url = "https://tutor.example.com"
            timeout_secs = 5

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.base_url, "https://tutor.example.com");
        assert_eq!(config.api.timeout(), Duration::from_secs(5));
        assert_eq!(config.api.retry_delay(), Duration::from_millis(1000));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.api.base_url = "localhost:8000".to_string();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.api.retry_attempts = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.storage.prefix = "a:b".to_string();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.upload.allowed_extensions.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config_or_default(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8000");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tutor.toml");
        std::fs::write(&path, "[api]\ntimeout_secs = 0\n").unwrap();
        assert!(load_config_or_default(&path).is_err());
    }

    #[test]
    fn max_file_size_in_bytes() {
        let upload = UploadConfig::default();
        assert_eq!(upload.max_file_size_bytes(), 50 * 1024 * 1024);
    }

    #[test]
    fn huge_file_size_limit_saturates() {
        let config: Config = toml::from_str(&format!(
            "[upload]\nmax_file_size_mb = {}\n",
            u64::MAX / 1000
        ))
        .unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.upload.max_file_size_bytes(), u64::MAX);
        assert!(crate::api::ApiClient::new(&config).is_ok());
    }
}
