use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::utils;

pub const DEFAULT_FEED_URL: &str = "https://www.broadcast.events/api/queryAllEventsByRegion_vM?&region=Oslo&published=true&limit=5000&skip=0";
const DEFAULT_USER_AGENT: &str = "show-digest/0.1 (weekly event digest; personal use)";
const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Oslo;
const DEFAULT_CACHE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub feed_url: String,
    pub feed_user_agent: String,
    pub feed_connect_timeout_secs: u64,
    pub feed_timeout_secs: u64,
    pub cache_duration_minutes: i64,
    pub fetch_delay_ms: u64,
    pub database_path: Option<PathBuf>,
    pub sendgrid_api_key: Option<String>,
    pub from_email: Option<String>,
    pub digest_timezone: String,
    pub delivery_max_attempts: u32,
    pub delivery_retry_delay_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            feed_user_agent: DEFAULT_USER_AGENT.to_string(),
            feed_connect_timeout_secs: 10,
            feed_timeout_secs: 30,
            cache_duration_minutes: DEFAULT_CACHE_MINUTES,
            fetch_delay_ms: 1000,
            database_path: None,
            sendgrid_api_key: None,
            from_email: None,
            digest_timezone: DEFAULT_TIMEZONE.name().to_string(),
            delivery_max_attempts: 1,
            delivery_retry_delay_secs: 30,
        }
    }
}

impl AppConfig {
    /// Settings file in the data directory, then environment overrides.
    pub fn load() -> Self {
        let path = utils::config_path();
        let mut config = match read_config(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("ignoring unreadable config {:?}: {err}", path);
                AppConfig::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = text("FEED_URL") {
            self.feed_url = url;
        }
        if let Some(agent) = text("FEED_USER_AGENT") {
            self.feed_user_agent = agent;
        }
        if let Some(secs) = text("FEED_CONNECT_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.feed_connect_timeout_secs = secs;
        }
        if let Some(secs) = text("FEED_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.feed_timeout_secs = secs;
        }
        if let Some(minutes) = text("CACHE_DURATION_MINUTES").and_then(|s| s.parse().ok()) {
            self.cache_duration_minutes = minutes;
        }
        if let Some(ms) = text("FETCH_DELAY_MS").and_then(|s| s.parse().ok()) {
            self.fetch_delay_ms = ms;
        }
        if let Some(path) = text("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(key) = text("SENDGRID_API_KEY") {
            self.sendgrid_api_key = Some(key);
        }
        if let Some(from) = text("FROM_EMAIL") {
            self.from_email = Some(from);
        }
        if let Some(tz) = text("DIGEST_TIMEZONE") {
            self.digest_timezone = tz;
        }
        if let Some(attempts) = text("DELIVERY_MAX_ATTEMPTS").and_then(|s| s.parse().ok()) {
            self.delivery_max_attempts = attempts;
        }
        if let Some(secs) = text("DELIVERY_RETRY_DELAY_SECS").and_then(|s| s.parse().ok()) {
            self.delivery_retry_delay_secs = secs;
        }
    }

    pub fn timezone(&self) -> Tz {
        match self.digest_timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(err) => {
                tracing::warn!(
                    "unknown digest timezone {:?} ({err}); using {}",
                    self.digest_timezone,
                    DEFAULT_TIMEZONE.name()
                );
                DEFAULT_TIMEZONE
            }
        }
    }

    pub fn cache_duration(&self) -> chrono::Duration {
        let minutes = self.cache_duration_minutes.max(0);
        chrono::Duration::try_minutes(minutes).unwrap_or_else(|| {
            tracing::warn!(
                "cache duration of {minutes} minutes is out of range; using {DEFAULT_CACHE_MINUTES}"
            );
            chrono::Duration::minutes(DEFAULT_CACHE_MINUTES)
        })
    }

    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(utils::database_path)
    }
}

fn read_config(path: &Path) -> Result<AppConfig, String> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&contents).map_err(|err| err.to_string())
}
