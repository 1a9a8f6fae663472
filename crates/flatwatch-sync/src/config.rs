use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use flatwatch_adapters::{ExtractorConfig, UnknownDatePolicy};
use flatwatch_core::DEFAULT_DAILY_CAP;
use flatwatch_storage::fetch::DEFAULT_USER_AGENT;
use flatwatch_storage::{HttpClientConfig, RetryPolicy};

use crate::schedule::{cron_for_interval, ActiveWindow};

/// Largest accepted recency window.
pub const MAX_AGE_DAYS_LIMIT: i64 = 30;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_path: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub admin_chat_id: Option<String>,
    pub debug_stats: bool,
    pub support_contact: String,
    pub notify_interval_minutes: u32,
    pub window: ActiveWindow,
    pub timezone: Tz,
    pub daily_limit: u32,
    pub max_age_days: i64,
    pub unknown_date: UnknownDatePolicy,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_retries: usize,
    pub retry_delay_ms: u64,
    pub request_spacing_ms: u64,
    pub min_body_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            state_path: PathBuf::from("./state/flatwatch.json"),
            telegram_bot_token: None,
            admin_chat_id: None,
            debug_stats: false,
            support_contact: "the administrator".to_string(),
            notify_interval_minutes: 30,
            window: ActiveWindow::default(),
            timezone: chrono_tz::Europe::Berlin,
            daily_limit: DEFAULT_DAILY_CAP,
            max_age_days: 1,
            unknown_date: UnknownDatePolicy::AssumeFresh,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            fetch_retries: 2,
            retry_delay_ms: 1000,
            request_spacing_ms: 2000,
            min_body_bytes: 1000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset or blank keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let notify_interval_minutes = parsed(&get, "NOTIFY_INTERVAL_MINUTES", defaults.notify_interval_minutes)?;
        cron_for_interval(notify_interval_minutes).context("NOTIFY_INTERVAL_MINUTES")?;

        let start = time_of_day(&get, "SCHED_START", defaults.window.start)?;
        let end = time_of_day(&get, "SCHED_END", defaults.window.end)?;

        let timezone = match get("FLATWATCH_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| anyhow!("FLATWATCH_TIMEZONE: unknown timezone {name:?}: {e}"))?,
            None => defaults.timezone,
        };

        let max_age_days: i64 = parsed(&get, "FLATWATCH_MAX_AGE_DAYS", defaults.max_age_days)?;
        let daily_limit: u32 = parsed(&get, "USER_DAILY_LIMIT", defaults.daily_limit)?;
        if daily_limit == 0 {
            bail!("USER_DAILY_LIMIT must be at least 1");
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            state_path: get("FLATWATCH_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_path),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            admin_chat_id: get("FLATWATCH_ADMIN_CHAT_ID"),
            debug_stats: flag(&get, "FLATWATCH_DEBUG_STATS")?,
            support_contact: get("FLATWATCH_SUPPORT_CONTACT").unwrap_or(defaults.support_contact),
            notify_interval_minutes,
            window: ActiveWindow::new(start, end),
            timezone,
            daily_limit,
            max_age_days: max_age_days.clamp(0, MAX_AGE_DAYS_LIMIT),
            unknown_date: parsed(&get, "FLATWATCH_UNKNOWN_DATE", defaults.unknown_date)?,
            user_agent: get("FLATWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed(&get, "FLATWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            fetch_retries: parsed(&get, "FLATWATCH_FETCH_RETRIES", defaults.fetch_retries)?,
            retry_delay_ms: parsed(&get, "FLATWATCH_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            request_spacing_ms: parsed(&get, "FLATWATCH_REQUEST_SPACING_MS", defaults.request_spacing_ms)?,
            min_body_bytes: parsed(&get, "FLATWATCH_MIN_BODY_BYTES", defaults.min_body_bytes)?,
        })
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_age_days: self.max_age_days,
            unknown_date: self.unknown_date,
            timezone: self.timezone,
        }
    }

    /// Retry waits start at `retry_delay_ms`, double per retry and stop at eight times that.
    pub fn retry_policy(&self) -> RetryPolicy {
        let first_delay = Duration::from_millis(self.retry_delay_ms);
        RetryPolicy {
            retries: self.fetch_retries,
            first_delay,
            max_delay: first_delay.saturating_mul(8),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_spacing: Duration::from_millis(self.request_spacing_ms),
            ..Default::default()
        }
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("{key}: invalid value {raw:?}: {e}")),
        None => Ok(default),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match get(key).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "TRUE" | "True" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "False" | "no") => Ok(false),
        Some(other) => bail!("{key}: expected a boolean, got {other:?}"),
    }
}

fn time_of_day(get: &impl Fn(&str) -> Option<String>, key: &str, default: NaiveTime) -> Result<NaiveTime> {
    match get(key) {
        Some(raw) => NaiveTime::parse_from_str(&raw, "%H:%M")
            .with_context(|| format!("{key}: expected HH:MM, got {raw:?}")),
        None => Ok(default),
    }
}
