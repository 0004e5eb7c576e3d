//! The adaptive scheduler service.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::policy::{FrameRatePolicy, FrameRateStatus, QualityControl};
use super::retry::{RetryBudget, RetryDecision};
use super::task::{FnTask, TaskRef, execute};
use crate::config::{MIN_TEST_INTERVAL, SchedulerConfig};
use crate::error::TaskError;
use crate::events::{
    Event, ListenerRegistry, MonitorEvent, MonitorEventKind, SchedulerEvent, SchedulerEventKind,
    Subscription,
};
use crate::monitor::ResourceMonitor;

/// Reason published when a run exhausts its retry budget.
pub const MAX_RETRIES_REACHED: &str = "Max retries reached";

/// How long [`AdaptiveScheduler::shutdown`] waits for an in-flight run.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one call to [`AdaptiveScheduler::run_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was active; nothing was done.
    AlreadyRunning,
    /// The queue was drained. `executed` counts every attempt, retries included.
    Completed { executed: usize },
    /// The retry budget ran out; the failing task is still queued.
    Aborted { reason: String, remaining: usize },
    /// The scheduler was stopped before the queue was drained.
    Cancelled { remaining: usize },
}

/// Serializable view of the scheduler for the control panel.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub auto_run: bool,
    pub queue_len: usize,
    pub retry_count: u32,
    pub max_retries: u32,
    pub test_interval_secs: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<Uuid>,
    pub quality_level: u32,
    pub target_frame_rate: f32,
    pub critical_frame_rate: f32,
}

/// Holds the running flag for the lifetime of a run, and clears it on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs queued maintenance tasks sequentially on a timer, with a global retry budget.
///
/// Only one run is active at a time. Ticks and forced runs that arrive while
/// a run is active are dropped.
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    queue: Mutex<VecDeque<TaskRef>>,
    running: AtomicBool,
    retry: RetryBudget,
    auto_run: AtomicBool,
    test_interval_ms: AtomicU64,
    last_run: Mutex<Instant>,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    last_run_id: Mutex<Option<Uuid>>,
    quality: Arc<dyn QualityControl>,
    frame_rate_policy: FrameRatePolicy,
    events: ListenerRegistry<SchedulerEvent>,
    monitor_subscription: Mutex<Option<Subscription<MonitorEvent>>>,
    active_run: Mutex<Option<JoinHandle<RunOutcome>>>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for AdaptiveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveScheduler")
            .field("is_running", &self.is_running())
            .field("queue_len", &self.queue_len())
            .field("retry_count", &self.retry_count())
            .finish()
    }
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, quality: Arc<dyn QualityControl>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            retry: RetryBudget::new(config.max_retries),
            auto_run: AtomicBool::new(config.auto_run),
            test_interval_ms: AtomicU64::new(duration_to_millis(config.test_interval())),
            last_run: Mutex::new(Instant::now()),
            last_run_at: Mutex::new(None),
            last_run_id: Mutex::new(None),
            quality,
            frame_rate_policy: FrameRatePolicy::new(
                config.target_frame_rate,
                config.critical_frame_rate,
            ),
            events: ListenerRegistry::new(config.listener_timeout()),
            monitor_subscription: Mutex::new(None),
            active_run: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Append a task to the tail of the queue. Affects a run in progress.
    pub fn enqueue(&self, task: TaskRef) {
        debug!("Enqueued task '{}'", task.name());
        self.queue.lock().push_back(task);
    }

    /// Enqueue a closure as a named task.
    pub fn enqueue_fn<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.enqueue(Arc::new(FnTask::new(name, func)));
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Names of the queued tasks, head first.
    pub fn queued_task_names(&self) -> Vec<String> {
        self.queue
            .lock()
            .iter()
            .map(|task| task.name().to_string())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.current()
    }

    pub fn auto_run(&self) -> bool {
        self.auto_run.load(Ordering::Acquire)
    }

    /// Enable or disable timer-driven runs. Forced runs are unaffected.
    pub fn set_auto_run(&self, enabled: bool) {
        self.auto_run.store(enabled, Ordering::Release);
        info!("Automatic runs {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn test_interval(&self) -> Duration {
        Duration::from_millis(self.test_interval_ms.load(Ordering::Acquire))
    }

    /// Change the interval between automatic runs. Values below one second are
    /// raised to one second. Returns the interval in effect.
    pub fn set_test_interval(&self, interval: Duration) -> Duration {
        let interval = interval.max(MIN_TEST_INTERVAL);
        self.test_interval_ms
            .store(duration_to_millis(interval), Ordering::Release);
        info!("Test interval set to {:?}", interval);
        interval
    }

    /// The registry scheduler events are published through.
    pub fn events(&self) -> &ListenerRegistry<SchedulerEvent> {
        &self.events
    }

    /// Register a listener for one kind of scheduler event.
    pub fn subscribe<F>(&self, kind: SchedulerEventKind, listener: F) -> Subscription<SchedulerEvent>
    where
        F: Fn(&SchedulerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    async fn publish(&self, event: SchedulerEvent) {
        let kind = event.kind();
        let report = self.events.publish(event).await;
        if !report.is_clean() {
            debug!("Delivery of {:?} was not clean: {:?}", kind, report);
        }
    }

    /// Drain the queue once.
    ///
    /// Returns [`RunOutcome::AlreadyRunning`] without touching the queue if a
    /// run is active. Each failure re-enqueues the task at the tail and counts
    /// against the shared retry budget; each success resets it. Cancellation
    /// is observed between tasks and during the backoff wait.
    pub async fn run_all(&self) -> RunOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Run requested while another run is active, ignoring");
            return RunOutcome::AlreadyRunning;
        };

        let run_id = Uuid::new_v4();
        *self.last_run.lock() = Instant::now();
        *self.last_run_at.lock() = Some(Utc::now());
        *self.last_run_id.lock() = Some(run_id);
        self.retry.reset();

        info!("Run {} started with {} queued task(s)", run_id, self.queue_len());
        self.publish(SchedulerEvent::TestsStarted).await;

        let mut executed = 0;
        loop {
            if self.cancellation_token.is_cancelled() {
                return self.cancelled(run_id);
            }

            let next = self.queue.lock().pop_front();
            let Some(task) = next else {
                info!("Run {} completed ({} attempt(s))", run_id, executed);
                self.publish(SchedulerEvent::TestsCompleted).await;
                return RunOutcome::Completed { executed };
            };

            executed += 1;
            match execute(task.as_ref(), self.config.task_timeout()).await {
                Ok(()) => {
                    debug!("Task '{}' succeeded", task.name());
                    self.retry.record_success();
                }
                Err(e) => {
                    let name = task.name().to_string();
                    self.queue.lock().push_back(task);

                    match self.retry.record_failure() {
                        RetryDecision::Retry { attempt } => {
                            warn!(
                                "Task '{}' failed (retry {}/{}): {}",
                                name,
                                attempt,
                                self.retry.max_retries(),
                                e
                            );
                            tokio::select! {
                                _ = self.cancellation_token.cancelled() => {
                                    return self.cancelled(run_id);
                                }
                                _ = tokio::time::sleep(self.config.backoff_delay()) => {}
                            }
                        }
                        RetryDecision::Exhausted { attempts } => {
                            error!(
                                "Task '{}' failed: {}. Run {} aborted after {} retries",
                                name, e, run_id, attempts
                            );
                            let reason = MAX_RETRIES_REACHED.to_string();
                            self.publish(SchedulerEvent::TestFailed {
                                reason: reason.clone(),
                            })
                            .await;
                            return RunOutcome::Aborted {
                                reason,
                                remaining: self.queue_len(),
                            };
                        }
                    }
                }
            }
        }
    }

    fn cancelled(&self, run_id: Uuid) -> RunOutcome {
        let remaining = self.queue_len();
        info!("Run {} cancelled with {} task(s) left", run_id, remaining);
        RunOutcome::Cancelled { remaining }
    }

    /// Spawn a run unless one is already in flight. Returns whether a run was spawned.
    fn spawn_run(self: &Arc<Self>) -> bool {
        let mut active = self.active_run.lock();
        if self.is_running() || active.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let scheduler = Arc::clone(self);
        *active = Some(tokio::spawn(async move { scheduler.run_all().await }));
        true
    }

    /// Start a run now, outside the timer cadence.
    ///
    /// Dropped if a run is active. Returns whether a run was started.
    pub fn force_run_now(self: &Arc<Self>) -> bool {
        if self.cancellation_token.is_cancelled() {
            warn!("Forced run requested after stop, ignoring");
            return false;
        }
        let started = self.spawn_run();
        if started {
            info!("Forced run started");
        } else {
            debug!("Forced run dropped, a run is already active");
        }
        started
    }

    /// Whether an automatic run is due.
    pub fn is_due(&self) -> bool {
        self.auto_run() && !self.is_running() && self.last_run.lock().elapsed() > self.test_interval()
    }

    /// One interval check: starts a run in the background when one is due.
    pub fn tick(self: &Arc<Self>) -> bool {
        self.is_due() && self.spawn_run()
    }

    /// Run the interval-check loop until [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        info!(
            "Scheduler started (interval {:?}, max retries {}, auto run {})",
            self.test_interval(),
            self.retry.max_retries(),
            self.auto_run()
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// React to monitor events.
    ///
    /// High CPU or memory lowers the quality setting by one step; a stall is
    /// only logged, recovery belongs to the monitor. Replaces any earlier
    /// attachment.
    pub fn attach(&self, monitor: &ResourceMonitor) {
        let quality = Arc::clone(&self.quality);
        let subscription = monitor.events().subscribe_many(
            &[
                MonitorEventKind::StallDetected,
                MonitorEventKind::HighCpuUsage,
                MonitorEventKind::HighMemoryUsage,
            ],
            move |event| {
                match event {
                    MonitorEvent::StallDetected => {
                        info!("Monitor reported a stall, leaving recovery to the monitor");
                    }
                    MonitorEvent::HighCpuUsage => lower_quality(quality.as_ref(), "high CPU usage"),
                    MonitorEvent::HighMemoryUsage => {
                        lower_quality(quality.as_ref(), "high memory usage")
                    }
                    MonitorEvent::MetricsUpdated(_) => {}
                }
                Ok(())
            },
        );

        if let Some(previous) = self.monitor_subscription.lock().replace(subscription) {
            previous.revoke();
        }
        debug!("Scheduler attached to resource monitor");
    }

    /// Revoke the monitor subscription. Returns `false` if none was held.
    pub fn detach(&self) -> bool {
        match self.monitor_subscription.lock().take() {
            Some(subscription) => {
                subscription.revoke();
                debug!("Scheduler detached from resource monitor");
                true
            }
            None => false,
        }
    }

    /// Report a measured frame rate.
    ///
    /// Below the critical rate a `PerformanceWarning` is published and quality
    /// is lowered one step.
    pub async fn report_frame_rate(&self, frame_rate: f32) -> FrameRateStatus {
        let status = self.frame_rate_policy.classify(frame_rate);
        match status {
            FrameRateStatus::Critical => {
                warn!(
                    "Frame rate {:.1} fps below critical {:.1} fps",
                    frame_rate, self.frame_rate_policy.critical
                );
                self.publish(SchedulerEvent::PerformanceWarning { frame_rate })
                    .await;
                lower_quality(self.quality.as_ref(), "critical frame rate");
            }
            FrameRateStatus::BelowTarget => {
                debug!(
                    "Frame rate {:.1} fps below target {:.1} fps",
                    frame_rate, self.frame_rate_policy.target
                );
            }
            FrameRateStatus::Healthy => {}
        }
        status
    }

    pub fn quality_level(&self) -> u32 {
        self.quality.level()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.is_running(),
            auto_run: self.auto_run(),
            queue_len: self.queue_len(),
            retry_count: self.retry_count(),
            max_retries: self.retry.max_retries(),
            test_interval_secs: self.test_interval().as_secs_f64(),
            last_run_at: *self.last_run_at.lock(),
            last_run_id: *self.last_run_id.lock(),
            quality_level: self.quality.level(),
            target_frame_rate: self.frame_rate_policy.target,
            critical_frame_rate: self.frame_rate_policy.critical,
        }
    }

    /// Stop the timer loop. A task in flight finishes; nothing further is dequeued.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop, detach from the monitor, and wait for an in-flight run.
    pub async fn shutdown(&self) -> Option<RunOutcome> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// [`shutdown`](Self::shutdown) with a custom wait limit.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Option<RunOutcome> {
        info!("Shutting down scheduler (timeout: {:?})", timeout);
        self.stop();
        self.detach();

        let handle = self.active_run.lock().take()?;
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!("Run task ended abnormally during shutdown: {}", e);
                None
            }
            Err(_) => {
                warn!("Shutdown timeout reached, aborting in-flight run");
                abort.abort();
                None
            }
        }
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lower_quality(quality: &dyn QualityControl, cause: &str) {
    if quality.decrease() {
        info!("Lowered quality to {} due to {}", quality.level(), cause);
    } else {
        debug!(
            "Quality already at minimum ({}), ignoring {}",
            quality.min_level(),
            cause
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QualityLevel;

    fn scheduler(max_retries: u32) -> Arc<AdaptiveScheduler> {
        let config = SchedulerConfig {
            max_retries,
            backoff_delay_ms: 10,
            ..Default::default()
        };
        Arc::new(AdaptiveScheduler::new(config, Arc::new(QualityLevel::default())))
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let scheduler = scheduler(3);
        assert_eq!(scheduler.run_all().await, RunOutcome::Completed { executed: 0 });
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_guard_clears_flag_on_panic() {
        let flag = AtomicBool::new(false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = RunGuard::acquire(&flag).unwrap();
            assert!(RunGuard::acquire(&flag).is_none());
            panic!("drain loop failed");
        }));
        assert!(result.is_err());
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_set_test_interval_is_clamped() {
        let scheduler = scheduler(3);
        assert_eq!(
            scheduler.set_test_interval(Duration::from_millis(200)),
            Duration::from_secs(1)
        );
        assert_eq!(scheduler.test_interval(), Duration::from_secs(1));
        assert_eq!(
            scheduler.set_test_interval(Duration::from_secs(90)),
            Duration::from_secs(90)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_interval_and_auto_run() {
        let scheduler = scheduler(3);
        assert!(!scheduler.tick());

        // Due only once strictly more than the interval has passed.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!scheduler.is_due());

        tokio::time::advance(Duration::from_millis(1)).await;
        scheduler.set_auto_run(false);
        assert!(!scheduler.tick());

        scheduler.set_auto_run(true);
        assert!(scheduler.tick());
        assert!(!scheduler.tick());
        while scheduler.status().last_run_id.is_none() || scheduler.is_running() {
            tokio::task::yield_now().await;
        }
        let outcome = scheduler.shutdown().await;
        assert_eq!(outcome, Some(RunOutcome::Completed { executed: 0 }));
        assert!(scheduler.status().last_run_at.is_some());
    }

    #[test]
    fn test_huge_interval_does_not_truncate() {
        let scheduler = scheduler(3);
        assert_eq!(scheduler.set_test_interval(Duration::MAX), Duration::MAX);
        assert_eq!(scheduler.test_interval(), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_unvalidated_config_does_not_panic() {
        for test_interval_secs in [-1.0, f64::NAN, 1e30] {
            let config = SchedulerConfig {
                test_interval_secs,
                tick_interval_ms: 0,
                task_timeout_secs: Some(-3.0),
                ..Default::default()
            };
            let scheduler = Arc::new(AdaptiveScheduler::new(
                config,
                Arc::new(QualityLevel::default()),
            ));
            assert!(scheduler.test_interval() > Duration::ZERO);

            let handle = scheduler.spawn();
            tokio::task::yield_now().await;
            scheduler.stop();
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_critical_frame_rate_lowers_quality() {
        let scheduler = scheduler(3);
        let before = scheduler.quality_level();

        assert_eq!(scheduler.report_frame_rate(59.0).await, FrameRateStatus::BelowTarget);
        assert_eq!(scheduler.quality_level(), before);

        assert_eq!(scheduler.report_frame_rate(12.0).await, FrameRateStatus::Critical);
        assert_eq!(scheduler.quality_level(), before - 1);
    }

    #[tokio::test]
    async fn test_status_serializes() {
        let scheduler = scheduler(4);
        scheduler.enqueue_fn("noop", || async { Ok(()) });
        let status = scheduler.status();
        assert_eq!(status.queue_len, 1);
        assert_eq!(status.max_retries, 4);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["queue_len"], 1);
        assert_eq!(json["is_running"], false);
    }
}
