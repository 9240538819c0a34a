// src/config.rs
//! Application configuration.
//!
//! Resolution order:
//! 1) `$NEWS_RELAY_CONFIG`, else `config/news_relay.toml` (missing file ⇒ defaults)
//! 2) environment overrides for secrets and a few common knobs
//! 3) validation
//!
//! Scoring tables live in their own file (`scoring.config_path`) so they can be
//! hot-reloaded without touching the rest.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::dedup::FingerprintAlgorithm;
use crate::model::validate_language_code;
use crate::publish::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "NEWS_RELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/news_relay.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupSection {
    pub algorithm: FingerprintAlgorithm,
    pub prefix_len: usize,
    pub retention_days: u32,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            algorithm: FingerprintAlgorithm::default(),
            prefix_len: 500,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringSection {
    pub threshold: u32,
    /// TOML file with keyword tiers and source weights. Built-in tables when unset.
    pub config_path: Option<PathBuf>,
    /// Poll `config_path` for changes.
    pub hot_reload: bool,
    pub reload_poll_secs: u64,
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            threshold: 8,
            config_path: None,
            hot_reload: false,
            reload_poll_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranslationSection {
    pub enabled: bool,
    pub source: String,
    pub target: String,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub timeout_secs: u64,
}

impl Default for TranslationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            source: "en".into(),
            target: "ru".into(),
            cache_ttl_secs: 3600,
            cache_capacity: 1000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub max_hashtags: usize,
    pub timeout_secs: u64,
    /// Log messages instead of sending them.
    pub dry_run: bool,
    /// A `pending` record older than this is treated as an abandoned attempt.
    pub pending_lease_secs: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            max_hashtags: 10,
            timeout_secs: 30,
            dry_run: false,
            pending_lease_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub workers: usize,
    pub shutdown_grace_secs: u64,
    pub retry_poll_secs: u64,
    pub retry_batch: usize,
    pub fetch_interval_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: 5,
            shutdown_grace_secs: 30,
            retry_poll_secs: 30,
            retry_batch: 50,
            fetch_interval_secs: 300,
            purge_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeedEntry {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelegramSection {
    pub token: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct YandexSection {
    pub api_key: String,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/news_relay.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub dedup: DedupSection,
    pub scoring: ScoringSection,
    pub translation: TranslationSection,
    pub publish: PublishSection,
    pub breaker: BreakerSection,
    pub pipeline: PipelineSection,
    pub feeds: Vec<FeedEntry>,
    pub telegram: TelegramSection,
    pub yandex: YandexSection,
    pub database: DatabaseSection,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path`; a missing file yields defaults. No env overrides, no validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(target: "config", path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// File from `$NEWS_RELAY_CONFIG` (or the default path), then env overrides, then validation.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_string("TELEGRAM_TOKEN") {
            self.telegram.token = v;
        }
        if let Some(v) = env_string("TELEGRAM_CHANNEL_ID") {
            self.telegram.channel_id = v;
        }
        if let Some(v) = env_string("YANDEX_API_KEY") {
            self.yandex.api_key = v;
        }
        if let Some(v) = env_string("YANDEX_FOLDER_ID") {
            self.yandex.folder_id = Some(v);
        }
        if let Some(v) = env_string("DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u32>("MIN_SCORE_THRESHOLD")? {
            self.scoring.threshold = v;
        }
        if let Some(v) = env_parse::<u32>("PUBLISH_MAX_RETRIES")? {
            self.publish.max_retries = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=2000).contains(&self.dedup.prefix_len) {
            return Err(invalid("dedup.prefix_len", "must be within 100..=2000"));
        }
        if self.dedup.retention_days == 0 {
            return Err(invalid("dedup.retention_days", "must be at least 1"));
        }
        if self.scoring.threshold > 100 {
            return Err(invalid("scoring.threshold", "must be within 0..=100"));
        }
        validate_language_code(&self.translation.source)
            .map_err(|e| invalid("translation.source", e.to_string()))?;
        validate_language_code(&self.translation.target)
            .map_err(|e| invalid("translation.target", e.to_string()))?;
        if self.translation.cache_capacity == 0 {
            return Err(invalid("translation.cache_capacity", "must be positive"));
        }
        if !(1..=10).contains(&self.publish.max_retries) {
            return Err(invalid("publish.max_retries", "must be within 1..=10"));
        }
        if !(1.0..=10.0).contains(&self.publish.backoff_base) {
            return Err(invalid("publish.backoff_base", "must be within 1.0..=10.0"));
        }
        if self.publish.pending_lease_secs <= self.publish.timeout_secs {
            return Err(invalid("publish.pending_lease_secs", "must exceed publish.timeout_secs"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.pipeline.workers == 0 {
            return Err(invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.retry_batch == 0 {
            return Err(invalid("pipeline.retry_batch", "must be at least 1"));
        }
        for f in &self.feeds {
            if f.name.trim().is_empty() || f.url.trim().is_empty() {
                return Err(invalid("feeds", "every feed needs a name and a url"));
            }
            if let Some(lang) = &f.language {
                validate_language_code(lang).map_err(|e| invalid("feeds.language", e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(self.breaker.recovery_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.publish.max_retries,
            backoff_base: self.publish.backoff_base,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.dedup.retention_days) * 24 * 3600)
    }

    /// Sending needs both a token and a channel; otherwise the binary dry-runs.
    pub fn telegram_configured(&self) -> bool {
        !self.telegram.token.trim().is_empty() && !self.telegram.channel_id.trim().is_empty()
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        None => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|e| ConfigError::Env {
            var,
            reason: format!("`{v}`: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const ENV_VARS: &[&str] = &[
        ENV_CONFIG_PATH,
        "TELEGRAM_TOKEN",
        "TELEGRAM_CHANNEL_ID",
        "YANDEX_API_KEY",
        "YANDEX_FOLDER_ID",
        "DATABASE_PATH",
        "MIN_SCORE_THRESHOLD",
        "PUBLISH_MAX_RETRIES",
    ];

    fn clear_env() {
        for v in ENV_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn defaults_are_valid() {
        let c = AppConfig::default();
        c.validate().unwrap();
        assert_eq!(c.scoring.threshold, 8);
        assert_eq!(c.dedup.algorithm, FingerprintAlgorithm::Sha256Truncated);
        assert_eq!(c.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = AppConfig::from_toml_str(
            r#"
[dedup]
algorithm = "sha256"

[publish]
max_retries = 5

[[feeds]]
name = "IGN"
url = "https://feeds.ign.com/ign/all"
"#,
        )
        .unwrap();
        assert_eq!(c.dedup.algorithm, FingerprintAlgorithm::Sha256);
        assert_eq!(c.dedup.prefix_len, 500);
        assert_eq!(c.publish.max_retries, 5);
        assert_eq!(c.publish.backoff_base, 2.0);
        assert!(c.feeds[0].enabled);
        c.validate().unwrap();
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut c = AppConfig::default();
        c.publish.max_retries = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { field: "publish.max_retries", .. })));

        let mut c = AppConfig::default();
        c.dedup.prefix_len = 50;
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.translation.target = "rus".into();
        assert!(c.validate().is_err());

        let mut c = AppConfig::default();
        c.publish.pending_lease_secs = c.publish.timeout_secs;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { field: "publish.pending_lease_secs", .. })));

        assert!(AppConfig::from_toml_str("[dedup]\nalgorithm = \"md5\"").is_err());
    }

    #[serial_test::serial]
    #[test]
    fn load_default_reads_file_then_env() {
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("relay.toml");
        fs::write(&p, "[scoring]\nthreshold = 12\n[telegram]\nchannel_id = \"@file\"\n").unwrap();

        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        env::set_var("TELEGRAM_CHANNEL_ID", "@env");
        env::set_var("PUBLISH_MAX_RETRIES", "4");

        let c = AppConfig::load_default().unwrap();
        assert_eq!(c.scoring.threshold, 12);
        assert_eq!(c.telegram.channel_id, "@env");
        assert_eq!(c.publish.max_retries, 4);
        assert!(!c.telegram_configured());

        clear_env();
    }

    #[serial_test::serial]
    #[test]
    fn bad_env_number_is_an_error() {
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        env::set_var("MIN_SCORE_THRESHOLD", "eight");
        assert!(matches!(
            AppConfig::load_default(),
            Err(ConfigError::Env { var: "MIN_SCORE_THRESHOLD", .. })
        ));
        clear_env();
    }
}
