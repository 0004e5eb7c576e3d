//! Environment-variable loading for [`AppConfig`].

use std::str::FromStr;

use super::settings::AppConfig;
use crate::{Error, Result};

impl AppConfig {
    /// Load configuration from the process environment, falling back to defaults.
    ///
    /// A `.env` file in the working directory is honored. Supported variables:
    /// - `HEALTHWATCH_SAMPLE_INTERVAL_SECS`
    /// - `HEALTHWATCH_HIGH_CPU_THRESHOLD`
    /// - `HEALTHWATCH_HIGH_MEMORY_THRESHOLD`
    /// - `HEALTHWATCH_MAX_STALL_SECS`
    /// - `HEALTHWATCH_TEST_INTERVAL_SECS`
    /// - `HEALTHWATCH_MAX_RETRIES`
    /// - `HEALTHWATCH_BACKOFF_DELAY_MS`
    /// - `HEALTHWATCH_AUTO_RUN` ("1", "true", "yes", "on")
    /// - `HEALTHWATCH_TARGET_FRAME_RATE`
    /// - `HEALTHWATCH_CRITICAL_FRAME_RATE`
    /// - `HEALTHWATCH_TASK_TIMEOUT_SECS`
    /// - `HEALTHWATCH_LISTENER_TIMEOUT_MS`
    /// - `HEALTHWATCH_LOG_DIR`
    /// - `HEALTHWATCH_LOG` (tracing filter directive)
    ///
    /// Unparseable values are reported as [`Error::Configuration`] and the
    /// result is validated before it is returned.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = parse(&get, "HEALTHWATCH_SAMPLE_INTERVAL_SECS")? {
            config.monitor.sample_interval_secs = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_HIGH_CPU_THRESHOLD")? {
            config.monitor.high_cpu_threshold = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_HIGH_MEMORY_THRESHOLD")? {
            config.monitor.high_memory_threshold = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_MAX_STALL_SECS")? {
            config.monitor.max_stall_secs = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_TEST_INTERVAL_SECS")? {
            config.scheduler.test_interval_secs = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_MAX_RETRIES")? {
            config.scheduler.max_retries = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_BACKOFF_DELAY_MS")? {
            config.scheduler.backoff_delay_ms = v;
        }
        if let Some(v) = get("HEALTHWATCH_AUTO_RUN") {
            config.scheduler.auto_run = matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_TARGET_FRAME_RATE")? {
            config.scheduler.target_frame_rate = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_CRITICAL_FRAME_RATE")? {
            config.scheduler.critical_frame_rate = v;
        }
        if let Some(v) = parse(&get, "HEALTHWATCH_TASK_TIMEOUT_SECS")? {
            config.scheduler.task_timeout_secs = Some(v);
        }
        if let Some(v) = parse::<u64, _>(&get, "HEALTHWATCH_LISTENER_TIMEOUT_MS")? {
            config.monitor.listener_timeout_ms = v;
            config.scheduler.listener_timeout_ms = v;
        }
        if let Some(v) = get("HEALTHWATCH_LOG_DIR") {
            config.log_dir = v;
        }
        config.log_filter = get("HEALTHWATCH_LOG");

        config.validate()?;
        Ok(config)
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid value for {key} ({raw:?}): {e}"))),
        None => Ok(None),
    }
}
