use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BotError;

/// Environment variable holding the bot token. Takes precedence over the file.
pub const TOKEN_ENV: &str = "BOT_TOKEN";
/// Environment variable overriding `[downloads] directory`.
pub const AUDIO_DIR_ENV: &str = "AUDIO_DIR";
/// Environment variable pointing at the optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "BOT_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Server-side long-poll timeout passed to getUpdates.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Applies to getFile and to the file download itself.
    #[serde(default = "default_file_timeout")]
    pub file_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_pacing")]
    pub pacing_secs: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub directory: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_cron")]
    pub cron: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    10
}

fn default_send_timeout() -> u64 {
    5
}

fn default_file_timeout() -> u64 {
    30
}

fn default_pacing() -> u64 {
    3
}

fn default_error_backoff() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    60
}

fn default_failure_alert_threshold() -> u32 {
    5
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("audio")
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_cron() -> String {
    "0 0 * * * *".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            poll_timeout_secs: default_poll_timeout(),
            send_timeout_secs: default_send_timeout(),
            file_timeout_secs: default_file_timeout(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            pacing_secs: default_pacing(),
            error_backoff_secs: default_error_backoff(),
            max_backoff_secs: default_max_backoff(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: default_download_dir(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cron: default_heartbeat_cron(),
        }
    }
}

impl TelegramConfig {
    /// Client-side timeout for getUpdates: the long-poll window plus a margin.
    pub fn poll_request_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs + 5)
    }
}

impl PollingConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_secs(self.pacing_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Config {
    /// Load `.env`, then the optional TOML file, then apply env overrides.
    ///
    /// A missing config file is not an error; a missing token is.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));
        let content = read_optional(&path)?;

        let config = Self::from_sources(
            content.as_deref(),
            std::env::var(TOKEN_ENV).ok(),
            std::env::var(AUDIO_DIR_ENV).ok(),
        )?;
        Ok(config)
    }

    /// Build a config from already-gathered inputs. Kept free of process
    /// state so it can be exercised directly.
    pub fn from_sources(
        toml_content: Option<&str>,
        token_env: Option<String>,
        audio_dir_env: Option<String>,
    ) -> Result<Self> {
        let mut config: Config = match toml_content {
            Some(content) => toml::from_str(content).context("Failed to parse config file")?,
            None => Config::default(),
        };

        if let Some(token) = token_env.filter(|t| !t.trim().is_empty()) {
            config.telegram.bot_token = token.trim().to_string();
        }
        if let Some(dir) = audio_dir_env.filter(|d| !d.trim().is_empty()) {
            config.downloads.directory = PathBuf::from(dir.trim());
        }

        if config.telegram.bot_token.trim().is_empty() {
            return Err(BotError::Config(format!("{TOKEN_ENV} environment variable not set")).into());
        }

        Ok(config)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e)
            .with_context(|| format!("Failed to read config file: {}", path.display())),
    }
}
