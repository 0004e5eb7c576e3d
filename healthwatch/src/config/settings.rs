//! Configuration structs and their validation rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default sampling interval (1 second).
const DEFAULT_SAMPLE_INTERVAL_SECS: f64 = 1.0;
/// Default high CPU threshold (percent).
const DEFAULT_HIGH_CPU_THRESHOLD: f32 = 80.0;
/// Default high memory threshold (percent).
const DEFAULT_HIGH_MEMORY_THRESHOLD: f32 = 90.0;
/// Default stall window (30 seconds).
const DEFAULT_MAX_STALL_SECS: f64 = 30.0;
/// Default per-listener delivery budget.
const DEFAULT_LISTENER_TIMEOUT_MS: u64 = 500;

/// Default interval between full runs (60 seconds).
const DEFAULT_TEST_INTERVAL_SECS: f64 = 60.0;
/// Default period of the interval-check tick.
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
/// Default global retry budget per run.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default fixed delay between retries.
const DEFAULT_BACKOFF_DELAY_MS: u64 = 1000;
/// Default frame rate the host aims for.
const DEFAULT_TARGET_FRAME_RATE: f32 = 60.0;
/// Default frame rate below which quality is lowered.
const DEFAULT_CRITICAL_FRAME_RATE: f32 = 20.0;

/// Smallest test interval accepted at runtime.
pub(crate) const MIN_TEST_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest period any timer derived from configuration may have.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);
/// Longest duration accepted for any time value (one year).
const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Convert seconds to a timer period, clamped to `[MIN_TIMER_PERIOD, MAX_DURATION_SECS]`.
///
/// Unvalidated configs can carry NaN, negative or huge values; none of them panic here.
fn period_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return MIN_TIMER_PERIOD;
    }
    Duration::try_from_secs_f64(secs.min(MAX_DURATION_SECS))
        .map_or(MIN_TIMER_PERIOD, |d| d.max(MIN_TIMER_PERIOD))
}

fn period_from_millis(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_TIMER_PERIOD)
}

/// Threshold configuration for a [`ResourceMonitor`](crate::monitor::ResourceMonitor).
///
/// Immutable once the monitor is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between two sampling ticks.
    pub sample_interval_secs: f64,
    /// CPU usage (percent, 0-100) above which `HighCpuUsage` fires.
    pub high_cpu_threshold: f32,
    /// Memory usage (percent, 0-100) above which `HighMemoryUsage` fires.
    pub high_memory_threshold: f32,
    /// Seconds without activity before a stall is reported.
    pub max_stall_secs: f64,
    /// Time budget per listener invocation, in milliseconds.
    pub listener_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            high_cpu_threshold: DEFAULT_HIGH_CPU_THRESHOLD,
            high_memory_threshold: DEFAULT_HIGH_MEMORY_THRESHOLD,
            max_stall_secs: DEFAULT_MAX_STALL_SECS,
            listener_timeout_ms: DEFAULT_LISTENER_TIMEOUT_MS,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        period_from_secs(self.sample_interval_secs)
    }

    pub fn max_stall(&self) -> Duration {
        period_from_secs(self.max_stall_secs)
    }

    pub fn listener_timeout(&self) -> Duration {
        period_from_millis(self.listener_timeout_ms)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        duration_secs("sample_interval_secs", self.sample_interval_secs)?;
        duration_secs("max_stall_secs", self.max_stall_secs)?;
        percent("high_cpu_threshold", self.high_cpu_threshold)?;
        percent("high_memory_threshold", self.high_memory_threshold)?;
        if self.listener_timeout_ms == 0 {
            return Err(Error::validation("listener_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Configuration for an [`AdaptiveScheduler`](crate::scheduler::AdaptiveScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between two automatic runs.
    pub test_interval_secs: f64,
    /// Period of the interval-check tick, in milliseconds.
    pub tick_interval_ms: u64,
    /// Global retry budget for one run.
    pub max_retries: u32,
    /// Fixed delay after each failed attempt, in milliseconds.
    pub backoff_delay_ms: u64,
    /// Whether the timer starts runs on its own.
    pub auto_run: bool,
    /// Frame rate the host aims for (frames per second).
    pub target_frame_rate: f32,
    /// Frame rate below which quality is reduced (frames per second).
    pub critical_frame_rate: f32,
    /// Optional time limit for a single task attempt, in seconds.
    pub task_timeout_secs: Option<f64>,
    /// Time budget per listener invocation, in milliseconds.
    pub listener_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            test_interval_secs: DEFAULT_TEST_INTERVAL_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_delay_ms: DEFAULT_BACKOFF_DELAY_MS,
            auto_run: true,
            target_frame_rate: DEFAULT_TARGET_FRAME_RATE,
            critical_frame_rate: DEFAULT_CRITICAL_FRAME_RATE,
            task_timeout_secs: None,
            listener_timeout_ms: DEFAULT_LISTENER_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn test_interval(&self) -> Duration {
        period_from_secs(self.test_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        period_from_millis(self.tick_interval_ms)
    }

    pub fn backoff_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_delay_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(period_from_secs)
    }

    pub fn listener_timeout(&self) -> Duration {
        period_from_millis(self.listener_timeout_ms)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        duration_secs("test_interval_secs", self.test_interval_secs)?;
        if self.tick_interval_ms == 0 {
            return Err(Error::validation("tick_interval_ms must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(Error::validation("max_retries must be at least 1"));
        }
        if self.listener_timeout_ms == 0 {
            return Err(Error::validation("listener_timeout_ms must be greater than 0"));
        }
        if let Some(timeout) = self.task_timeout_secs {
            duration_secs("task_timeout_secs", timeout)?;
        }
        positive("target_frame_rate", f64::from(self.target_frame_rate))?;
        if self.critical_frame_rate < 0.0 || self.critical_frame_rate > self.target_frame_rate {
            return Err(Error::validation(format!(
                "critical_frame_rate ({}) must be between 0 and target_frame_rate ({})",
                self.critical_frame_rate, self.target_frame_rate
            )));
        }
        Ok(())
    }
}

/// Top-level configuration for the `healthwatch` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    /// Directory for rolling log files.
    pub log_dir: String,
    /// Optional filter directive overriding the default one.
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            log_dir: "logs".to_string(),
            log_filter: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.monitor.validate()?;
        self.scheduler.validate()?;
        if self.log_dir.trim().is_empty() {
            return Err(Error::validation("log_dir must not be empty"));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::validation(format!("{name} must be a positive number, got {value}")))
    }
}

/// A positive number of seconds no longer than [`MAX_DURATION_SECS`].
fn duration_secs(name: &str, value: f64) -> Result<()> {
    positive(name, value)?;
    if value > MAX_DURATION_SECS {
        return Err(Error::validation(format!(
            "{name} must be at most {MAX_DURATION_SECS} seconds, got {value}"
        )));
    }
    Ok(())
}

fn percent(name: &str, value: f32) -> Result<()> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(Error::validation(format!("{name} must be within (0, 100], got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.high_cpu_threshold, 80.0);
        assert_eq!(config.monitor.high_memory_threshold, 90.0);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.scheduler.test_interval(), Duration::from_secs(60));
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = SchedulerConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let config = MonitorConfig {
            high_cpu_threshold: 120.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MonitorConfig {
            high_memory_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_critical_frame_rate_above_target_rejected() {
        let config = SchedulerConfig {
            target_frame_rate: 30.0,
            critical_frame_rate: 45.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let config = SchedulerConfig {
            test_interval_secs: 1e30,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let config = MonitorConfig {
            max_stall_secs: f64::INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accessors_clamp_unvalidated_values() {
        let config = SchedulerConfig {
            test_interval_secs: 1e30,
            tick_interval_ms: 0,
            task_timeout_secs: Some(f64::NAN),
            ..Default::default()
        };
        assert_eq!(config.test_interval(), Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
        assert_eq!(config.task_timeout(), Some(Duration::from_millis(1)));

        let config = MonitorConfig {
            sample_interval_secs: 0.0,
            max_stall_secs: -5.0,
            ..Default::default()
        };
        assert_eq!(config.sample_interval(), Duration::from_millis(1));
        assert_eq!(config.max_stall(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "monitor": { "high_cpu_threshold": 75.0 }, "scheduler": { "max_retries": 5 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.monitor.high_cpu_threshold, 75.0);
        assert_eq!(config.monitor.max_stall_secs, 30.0);
        assert_eq!(config.scheduler.max_retries, 5);
        assert!(config.scheduler.auto_run);
        assert_eq!(config.log_dir, "logs");
    }
}
