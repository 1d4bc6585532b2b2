//! Configuration and settings management
//!
//! Loads settings from config files and environment variables. Every tunable
//! has a default so only the bot token is mandatory.

use crate::download::platform::Platform;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    #[serde(alias = "api_token")]
    pub telegram_token: String,

    /// Path of the persisted per-user usage statistics
    #[serde(default = "default_usage_file")]
    pub usage_file: PathBuf,
    /// Path of the persisted per-user daily quota counters
    #[serde(default = "default_quota_file")]
    pub quota_file: PathBuf,

    /// Seconds before an unanswered link choice expires
    #[serde(default = "default_correlation_ttl_secs")]
    pub correlation_ttl_secs: u64,
    /// Hard cap on pending link choices
    #[serde(default = "default_correlation_max_entries")]
    pub correlation_max_entries: usize,
    /// Seconds between periodic correlation sweeps
    #[serde(default = "default_correlation_sweep_interval_secs")]
    pub correlation_sweep_interval_secs: u64,

    /// Number of concurrent download workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Capacity of the download queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Directory for temporary download artifacts
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// Age in seconds after which stray temp files are removed
    #[serde(default = "default_tmp_clean_interval_secs")]
    pub tmp_clean_interval_secs: u64,

    /// Minimum seconds between two requests of the same user
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Daily request limit for rate-limited platforms
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Comma-separated platform tags subject to the daily limit
    #[serde(default = "default_rate_limited_platforms")]
    pub rate_limited_platforms: String,

    /// Largest file (MB) sent as media; bigger files get a fallback page
    #[serde(default = "default_max_send_mb")]
    pub max_send_mb: u64,
    /// Seconds between ledger autosaves
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,

    /// Directory holding optional `<platform>_cookies.txt` files
    #[serde(default = "default_cookies_dir")]
    pub cookies_dir: PathBuf,
    /// yt-dlp executable
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    /// ffmpeg executable, probed once at startup
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Name shown in media captions
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
}

fn default_usage_file() -> PathBuf {
    PathBuf::from("/mnt/data/usage.json")
}

fn default_quota_file() -> PathBuf {
    PathBuf::from("/mnt/data/insta_usage.json")
}

const fn default_correlation_ttl_secs() -> u64 {
    60 * 60
}

const fn default_correlation_max_entries() -> usize {
    2000
}

const fn default_correlation_sweep_interval_secs() -> u64 {
    600
}

const fn default_max_workers() -> usize {
    12
}

const fn default_queue_capacity() -> usize {
    500
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

const fn default_tmp_clean_interval_secs() -> u64 {
    3600
}

const fn default_cooldown_secs() -> u64 {
    3
}

const fn default_daily_limit() -> u32 {
    10
}

fn default_rate_limited_platforms() -> String {
    "instagram".to_string()
}

const fn default_max_send_mb() -> u64 {
    50
}

const fn default_autosave_interval_secs() -> u64 {
    60
}

fn default_cookies_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_bot_name() -> String {
    "TB_Loader".to_string()
}

/// Builds the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if a present source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Local overrides, not checked into git
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Bare variables: UPPER_SNAKE_CASE maps to snake_case, empty means unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or the token is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = build_config()?.try_deserialize()?;
        if settings.telegram_token.trim().is_empty() {
            return Err(ConfigError::Message(
                "TELEGRAM_TOKEN (or API_TOKEN) is empty".to_string(),
            ));
        }
        Ok(settings)
    }

    /// Settings with every default and the given token
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            telegram_token: token.into(),
            usage_file: default_usage_file(),
            quota_file: default_quota_file(),
            correlation_ttl_secs: default_correlation_ttl_secs(),
            correlation_max_entries: default_correlation_max_entries(),
            correlation_sweep_interval_secs: default_correlation_sweep_interval_secs(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            tmp_dir: default_tmp_dir(),
            tmp_clean_interval_secs: default_tmp_clean_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            daily_limit: default_daily_limit(),
            rate_limited_platforms: default_rate_limited_platforms(),
            max_send_mb: default_max_send_mb(),
            autosave_interval_secs: default_autosave_interval_secs(),
            cookies_dir: default_cookies_dir(),
            ytdlp_path: default_ytdlp_path(),
            ffmpeg_path: default_ffmpeg_path(),
            bot_name: default_bot_name(),
        }
    }

    /// Platforms subject to the daily limit. Unknown tags are ignored.
    #[must_use]
    pub fn rate_limited(&self) -> HashSet<Platform> {
        self.rate_limited_platforms
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(|tag| tag.parse::<Platform>().ok())
            .collect()
    }

    /// Correlation time-to-live
    #[must_use]
    pub const fn correlation_ttl(&self) -> Duration {
        Duration::from_secs(self.correlation_ttl_secs)
    }

    /// Per-user cooldown window
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Maximum media size in bytes
    #[must_use]
    pub const fn max_send_bytes(&self) -> u64 {
        self.max_send_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Single test touching the process environment to avoid races
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_TOKEN", "dummy_token");
        env::set_var("MAX_WORKERS", "4");
        env::set_var("COOLDOWN_SECS", "");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_token, "dummy_token");
        assert_eq!(settings.max_workers, 4);
        assert_eq!(settings.cooldown_secs, 3);
        assert_eq!(settings.queue_capacity, 500);

        env::remove_var("TELEGRAM_TOKEN");
        env::remove_var("MAX_WORKERS");
        env::remove_var("COOLDOWN_SECS");
        Ok(())
    }

    #[test]
    fn test_rate_limited_parsing() {
        let mut settings = Settings::with_token("dummy");
        assert_eq!(
            settings.rate_limited(),
            HashSet::from([Platform::Instagram])
        );

        settings.rate_limited_platforms = "instagram; tiktok, myspace".to_string();
        let limited = settings.rate_limited();
        assert!(limited.contains(&Platform::Instagram));
        assert!(limited.contains(&Platform::TikTok));
        assert_eq!(limited.len(), 2);

        settings.rate_limited_platforms = String::new();
        assert!(settings.rate_limited().is_empty());
    }

    #[test]
    fn test_derived_values() {
        let settings = Settings::with_token("dummy");
        assert_eq!(settings.max_send_bytes(), 50 * 1024 * 1024);
        assert_eq!(settings.correlation_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.cooldown(), Duration::from_secs(3));
    }
}
