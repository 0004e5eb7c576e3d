//! The resource monitor service and its sampling loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::liveness::{ActivityHandle, Liveness};
use super::recovery::{NoopRecovery, RecoveryHooks};
use super::source::{MetricsSource, ProcessSnapshot, SysinfoSource};
use crate::Error;
use crate::config::MonitorConfig;
use crate::events::{
    DeliveryReport, Event, ListenerRegistry, MetricSample, MonitorEvent, MonitorEventKind, Subscription,
};

/// Structured diagnostic record logged on every detected stall.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub idle_secs: f64,
    pub max_stall_secs: f64,
    pub sampling_enabled: bool,
    pub last_sample: Option<MetricSample>,
    pub process: Option<ProcessSnapshot>,
}

/// Observes host health and publishes [`MonitorEvent`]s.
///
/// The monitor owns no policy; subscribers decide how to react.
pub struct ResourceMonitor {
    config: MonitorConfig,
    source: Mutex<Option<Box<dyn MetricsSource>>>,
    sampling_enabled: AtomicBool,
    liveness: Arc<Liveness>,
    recovery: Arc<dyn RecoveryHooks>,
    events: ListenerRegistry<MonitorEvent>,
    latest_sample: Mutex<Option<MetricSample>>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("config", &self.config)
            .field("sampling_enabled", &self.is_sampling())
            .field("idle", &self.liveness.idle())
            .finish()
    }
}

impl ResourceMonitor {
    /// Create a monitor backed by the host's `sysinfo` metrics.
    ///
    /// If the metrics source cannot be initialized the failure is logged once
    /// and sampling stays disabled; stall detection still works.
    pub fn new(config: MonitorConfig) -> Self {
        let source: Option<Box<dyn MetricsSource>> = match SysinfoSource::new() {
            Ok(source) => Some(Box::new(source)),
            Err(e) => {
                error!("Failed to initialize metrics source, sampling disabled: {}", e);
                None
            }
        };
        Self::build(config, source)
    }

    /// Create a monitor with a custom metrics source.
    pub fn with_source(config: MonitorConfig, source: impl MetricsSource) -> Self {
        Self::build(config, Some(Box::new(source)))
    }

    fn build(config: MonitorConfig, source: Option<Box<dyn MetricsSource>>) -> Self {
        let events = ListenerRegistry::new(config.listener_timeout());
        Self {
            sampling_enabled: AtomicBool::new(source.is_some()),
            source: Mutex::new(source),
            liveness: Arc::new(Liveness::new()),
            recovery: Arc::new(NoopRecovery),
            events,
            latest_sample: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
            config,
        }
    }

    /// Replace the recovery hooks run on a stall.
    pub fn with_recovery(mut self, hooks: impl RecoveryHooks) -> Self {
        self.recovery = Arc::new(hooks);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Report activity. Safe to call from any thread.
    pub fn record_activity(&self) {
        self.liveness.record();
    }

    /// A clonable handle for reporting activity from elsewhere.
    pub fn activity_handle(&self) -> ActivityHandle {
        ActivityHandle::new(Arc::clone(&self.liveness))
    }

    /// Time since the last recorded activity.
    pub fn idle_time(&self) -> Duration {
        self.liveness.idle()
    }

    /// Whether metrics sampling is still enabled.
    pub fn is_sampling(&self) -> bool {
        self.sampling_enabled.load(Ordering::Acquire)
    }

    /// The most recent successful sample, if any.
    pub fn latest_sample(&self) -> Option<MetricSample> {
        *self.latest_sample.lock()
    }

    /// The registry monitor events are published through.
    pub fn events(&self) -> &ListenerRegistry<MonitorEvent> {
        &self.events
    }

    /// Register a listener for one kind of monitor event.
    pub fn subscribe<F>(&self, kind: MonitorEventKind, listener: F) -> Subscription<MonitorEvent>
    where
        F: Fn(&MonitorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    /// Read current CPU and memory usage.
    ///
    /// Returns `None` when sampling is disabled or the read failed. A
    /// [`Error::MetricsUnavailable`] from the source disables sampling for good.
    pub fn sample(&self) -> Option<MetricSample> {
        if !self.is_sampling() {
            return None;
        }

        let result = {
            let mut source = self.source.lock();
            source.as_mut()?.sample()
        };

        match result {
            Ok((cpu, memory)) => {
                let sample = MetricSample::new(cpu, memory);
                *self.latest_sample.lock() = Some(sample);
                Some(sample)
            }
            Err(Error::MetricsUnavailable(reason)) => {
                error!("Metrics source became unavailable, sampling disabled: {}", reason);
                self.sampling_enabled.store(false, Ordering::Release);
                self.source.lock().take();
                None
            }
            Err(e) => {
                warn!("Failed to read system metrics, skipping this tick: {}", e);
                None
            }
        }
    }

    /// Decide which events a tick produces, without side effects.
    ///
    /// Threshold comparisons are strict. The stall check is independent of the
    /// sample, so a tick can yield any combination of events.
    pub fn evaluate(&self, sample: Option<&MetricSample>, idle: Duration) -> Vec<MonitorEvent> {
        let mut events = Vec::with_capacity(4);

        if let Some(sample) = sample {
            events.push(MonitorEvent::MetricsUpdated(*sample));
            if sample.cpu_usage_percent > self.config.high_cpu_threshold {
                events.push(MonitorEvent::HighCpuUsage);
            }
            if sample.memory_usage_percent > self.config.high_memory_threshold {
                events.push(MonitorEvent::HighMemoryUsage);
            }
        }

        if idle > self.config.max_stall() {
            events.push(MonitorEvent::StallDetected);
        }

        events
    }

    /// Run one sampling tick and return the events it published.
    pub async fn tick(&self) -> Vec<MonitorEvent> {
        let sample = self.sample();
        let idle = self.liveness.idle();
        let events = self.evaluate(sample.as_ref(), idle);

        for event in &events {
            match event {
                MonitorEvent::MetricsUpdated(_) => {}
                MonitorEvent::HighCpuUsage => warn!(
                    "High CPU usage: {:.1}% (threshold {:.1}%)",
                    sample.map_or(0.0, |s| s.cpu_usage_percent),
                    self.config.high_cpu_threshold
                ),
                MonitorEvent::HighMemoryUsage => warn!(
                    "High memory usage: {:.1}% (threshold {:.1}%)",
                    sample.map_or(0.0, |s| s.memory_usage_percent),
                    self.config.high_memory_threshold
                ),
                MonitorEvent::StallDetected => warn!(
                    "Stall detected: no activity for {:.1}s (limit {:.1}s)",
                    idle.as_secs_f64(),
                    self.config.max_stall_secs
                ),
            }

            let report = self.events.publish(event.clone()).await;
            if !report.is_clean() {
                debug!("Delivery of {:?} was not clean: {:?}", event.kind(), report);
            }

            if matches!(event, MonitorEvent::StallDetected) {
                self.recover(idle, sample);
            }
        }

        events
    }

    /// Recovery pass after a stall has been published.
    fn recover(&self, idle: Duration, sample: Option<MetricSample>) {
        if let Err(e) = self.recovery.release_cached_resources() {
            warn!("Failed to release cached resources: {:#}", e);
        }
        if let Err(e) = self.recovery.force_cleanup() {
            warn!("Cleanup pass failed: {:#}", e);
        }

        let process = self
            .source
            .lock()
            .as_mut()
            .and_then(|source| source.process_snapshot());
        let snapshot = SystemStateSnapshot {
            timestamp: Utc::now(),
            idle_secs: idle.as_secs_f64(),
            max_stall_secs: self.config.max_stall_secs,
            sampling_enabled: self.is_sampling(),
            last_sample: sample.or_else(|| self.latest_sample()),
            process,
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(snapshot = %json, "System state after stall"),
            Err(e) => warn!("Failed to serialize system state snapshot: {}", e),
        }

        // Start a new stall window so the event does not repeat every tick.
        self.liveness.record();
    }

    /// Run the sampling loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.sample_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        info!(
            "Resource monitor started (interval {:?}, sampling {})",
            self.config.sample_interval(),
            if self.is_sampling() { "enabled" } else { "disabled" }
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Resource monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    /// Stop the sampling loop.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Publish an event on behalf of the monitor.
    pub async fn publish(&self, event: MonitorEvent) -> DeliveryReport {
        self.events.publish(event).await
    }
}
