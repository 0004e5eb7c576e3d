//! Events published by the resource monitor and the adaptive scheduler.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event that can be routed through a [`ListenerRegistry`](super::ListenerRegistry).
pub trait Event: Clone + Send + Sync + 'static {
    /// Discriminant used as the subscription key.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Immutable snapshot of host resource usage produced by one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Global CPU usage in percent (0-100).
    pub cpu_usage_percent: f32,
    /// Used memory in percent of total memory (0-100).
    pub memory_usage_percent: f32,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(cpu_usage_percent: f32, memory_usage_percent: f32) -> Self {
        Self {
            cpu_usage_percent,
            memory_usage_percent,
            timestamp: Utc::now(),
        }
    }
}

/// Events raised by the [`ResourceMonitor`](crate::monitor::ResourceMonitor).
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A new sample was taken.
    MetricsUpdated(MetricSample),
    /// CPU usage is strictly above the configured threshold.
    HighCpuUsage,
    /// Memory usage is strictly above the configured threshold.
    HighMemoryUsage,
    /// No activity was recorded for longer than the stall window.
    StallDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorEventKind {
    MetricsUpdated,
    HighCpuUsage,
    HighMemoryUsage,
    StallDetected,
}

impl Event for MonitorEvent {
    type Kind = MonitorEventKind;

    fn kind(&self) -> Self::Kind {
        match self {
            Self::MetricsUpdated(_) => MonitorEventKind::MetricsUpdated,
            Self::HighCpuUsage => MonitorEventKind::HighCpuUsage,
            Self::HighMemoryUsage => MonitorEventKind::HighMemoryUsage,
            Self::StallDetected => MonitorEventKind::StallDetected,
        }
    }
}

/// Events raised by the [`AdaptiveScheduler`](crate::scheduler::AdaptiveScheduler).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A run started draining the queue.
    TestsStarted,
    /// The queue was drained without exhausting the retry budget.
    TestsCompleted,
    /// The run was aborted.
    TestFailed { reason: String },
    /// A reported frame rate fell below the critical threshold.
    PerformanceWarning { frame_rate: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerEventKind {
    TestsStarted,
    TestsCompleted,
    TestFailed,
    PerformanceWarning,
}

impl Event for SchedulerEvent {
    type Kind = SchedulerEventKind;

    fn kind(&self) -> Self::Kind {
        match self {
            Self::TestsStarted => SchedulerEventKind::TestsStarted,
            Self::TestsCompleted => SchedulerEventKind::TestsCompleted,
            Self::TestFailed { .. } => SchedulerEventKind::TestFailed,
            Self::PerformanceWarning { .. } => SchedulerEventKind::PerformanceWarning,
        }
    }
}

impl SchedulerEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::TestsStarted => "Tests started".to_string(),
            Self::TestsCompleted => "Tests completed".to_string(),
            Self::TestFailed { reason } => format!("Tests failed: {}", reason),
            Self::PerformanceWarning { frame_rate } => {
                format!("Performance warning: {:.1} fps", frame_rate)
            }
        }
    }
}
