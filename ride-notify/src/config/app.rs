//! Process configuration loaded from the environment.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use crate::api::ApiServerConfig;
use crate::change_feed::{ChangeLogPruneConfig, ChangeSourceConfig};
use crate::dispatch::DispatchConfig;
use crate::domain::BackoffPolicy;
use crate::queue::QueueConfig;
use crate::reconciler::ReconcilerConfig;
use crate::scheduler::{DelayDetectionConfig, PickupReminderConfig};
use crate::sender::HttpSmsConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:ride-notify.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// Overrides the built-in log filter; `RUST_LOG` still wins.
    pub log_filter: Option<String>,
    pub api: ApiServerConfig,
    pub dispatch: DispatchConfig,
    pub queue: QueueConfig,
    pub reconciler: ReconcilerConfig,
    pub change_feed_poll: Duration,
    /// Log rows fetched per change feed poll.
    pub change_feed_batch: i64,
    pub change_source: ChangeSourceConfig,
    pub change_log_prune: ChangeLogPruneConfig,
    pub reminder: PickupReminderConfig,
    pub delay: DelayDetectionConfig,
    /// Capacity of the webhook to reconciler channel.
    pub receipt_buffer: usize,
    /// `None` sends nothing and only logs.
    pub sms: Option<HttpSmsConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            log_filter: None,
            api: ApiServerConfig::default(),
            dispatch: DispatchConfig::default(),
            queue: QueueConfig::default(),
            reconciler: ReconcilerConfig::default(),
            change_feed_poll: Duration::from_millis(500),
            change_feed_batch: 100,
            change_source: ChangeSourceConfig::default(),
            change_log_prune: ChangeLogPruneConfig::default(),
            reminder: PickupReminderConfig::default(),
            delay: DelayDetectionConfig::default(),
            receipt_buffer: 1024,
            sms: None,
        }
    }
}

impl AppConfig {
    /// Read the process environment. Call `dotenvy::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their
    /// defaults; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = dir;
        }
        config.log_filter = get("LOG_FILTER");

        if let Some(addr) = get("API_BIND_ADDRESS") {
            config.api.bind_address = addr;
        }
        if let Some(port) = parse::<u16>(&get, "API_PORT")? {
            config.api.port = port;
        }

        if let Some(ms) = parse::<u64>(&get, "DISPATCH_TICK_MS")? {
            config.dispatch.tick_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = parse::<usize>(&get, "DISPATCH_CONCURRENCY")? {
            config.dispatch.concurrency_limit = limit;
        }
        if let Some(secs) = parse::<u64>(&get, "DISPATCH_STALE_SECS")? {
            config.dispatch.stale_after = Duration::from_secs(secs);
            // Keep the default send timeout inside a shortened stale window.
            config.dispatch.send_timeout = config
                .dispatch
                .send_timeout
                .min(config.dispatch.stale_after * 2 / 3);
        }
        if let Some(secs) = parse::<u64>(&get, "DISPATCH_SEND_TIMEOUT_SECS")? {
            config.dispatch.send_timeout = Duration::from_secs(secs);
        }
        config.dispatch.validate()?;

        let mut backoff = BackoffPolicy::default();
        if let Some(raw) = get("BACKOFF_TABLE_MS") {
            backoff.table_ms = parse_list::<u64>("BACKOFF_TABLE_MS", &raw)?;
            if backoff.table_ms.is_empty() {
                return Err(Error::config("BACKOFF_TABLE_MS must list at least one delay"));
            }
        }
        if let Some(cap) = parse::<u64>(&get, "BACKOFF_CAP_MS")? {
            backoff.cap_ms = cap;
        }
        if let Some(max) = parse::<u32>(&get, "MAX_RETRIES")? {
            backoff.max_retries = max;
        }
        config.queue.backoff = backoff;

        if let Some(raw) = get("RETRYABLE_ERROR_CODES") {
            config.reconciler.retryable_error_codes = raw
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect::<BTreeSet<_>>();
        }

        if let Some(ms) = parse::<u64>(&get, "CHANGE_FEED_POLL_MS")? {
            config.change_feed_poll = Duration::from_millis(ms.max(1));
        }
        if let Some(size) = parse::<i64>(&get, "CHANGE_FEED_BATCH")? {
            config.change_feed_batch = size.max(1);
        }
        if let Some(secs) = parse::<u64>(&get, "CHANGE_LOG_PRUNE_SECS")? {
            config.change_log_prune.interval = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = parse::<u64>(&get, "REMINDER_SCAN_SECS")? {
            config.reminder.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(mins) = parse::<u64>(&get, "REMINDER_LEAD_MINS")? {
            config.reminder.lead = Duration::from_secs(mins * 60);
        }
        if let Some(secs) = parse::<u64>(&get, "DELAY_SCAN_SECS")? {
            config.delay.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(mins) = parse::<u64>(&get, "DELAY_THRESHOLD_MINS")? {
            config.delay.threshold = Duration::from_secs(mins * 60);
        }

        if let Some(size) = parse::<usize>(&get, "RECEIPT_BUFFER")? {
            config.receipt_buffer = size.max(1);
        }

        if let Some(endpoint) = get("SMS_ENDPOINT") {
            let from = get("SMS_FROM")
                .ok_or_else(|| Error::config("SMS_FROM is required when SMS_ENDPOINT is set"))?;
            config.sms = Some(HttpSmsConfig {
                endpoint,
                auth_token: get("SMS_AUTH_TOKEN"),
                from,
                status_callback: get("SMS_STATUS_CALLBACK"),
                timeout_secs: parse::<u64>(&get, "SMS_TIMEOUT_SECS")?.unwrap_or(15),
            });
        }

        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::config(format!("invalid {}='{}': {}", key, raw, e)))
        })
        .transpose()
}

fn parse_list<T>(key: &str, raw: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| Error::config(format!("invalid entry '{}' in {}: {}", s, key, e)))
        })
        .collect()
}
