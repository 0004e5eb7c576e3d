use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use healthwatch::config::AppConfig;
use healthwatch::events::SchedulerEventKind;
use healthwatch::monitor::ResourceMonitor;
use healthwatch::scheduler::{AdaptiveScheduler, FnTask, QualityLevel, TaskRef};
use healthwatch::{TaskError, logging, panic_hook};

/// Highest level of the quality setting managed by this process.
const MAX_QUALITY_LEVEL: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir, config.log_filter.as_deref())
        .context("failed to initialize logging")?;
    panic_hook::install(&config.log_dir);

    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.child_token());

    info!(
        "healthwatch {} starting (log filter: {})",
        env!("CARGO_PKG_VERSION"),
        logging_config.get_filter()
    );

    let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
    let quality = Arc::new(QualityLevel::new(MAX_QUALITY_LEVEL, 0));
    let scheduler = Arc::new(AdaptiveScheduler::new(config.scheduler.clone(), quality));
    scheduler.attach(&monitor);

    // Scheduler progress counts as activity for stall detection.
    let activity = monitor.activity_handle();
    scheduler.events().subscribe_many(
        &[
            SchedulerEventKind::TestsStarted,
            SchedulerEventKind::TestsCompleted,
            SchedulerEventKind::TestFailed,
        ],
        move |event| {
            info!("{}", event.description());
            activity.record_activity();
            Ok(())
        },
    );

    // The suite is consumed by a successful run; queue it again for the next one.
    let suite = default_suite(&scheduler, &monitor);
    for task in &suite {
        scheduler.enqueue(Arc::clone(task));
    }
    let requeue = Arc::downgrade(&scheduler);
    scheduler.subscribe(SchedulerEventKind::TestsCompleted, move |_| {
        if let Some(scheduler) = requeue.upgrade() {
            for task in &suite {
                scheduler.enqueue(Arc::clone(task));
            }
        }
        Ok(())
    });

    let monitor_task = monitor.spawn();
    let scheduler_task = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    monitor.stop();
    if let Some(outcome) = scheduler.shutdown().await {
        info!("In-flight run finished during shutdown: {:?}", outcome);
    }

    for (name, task) in [("monitor", monitor_task), ("scheduler", scheduler_task)] {
        if let Err(e) = task.await {
            error!("{} loop ended abnormally: {}", name, e);
        }
    }

    info!("healthwatch stopped");
    Ok(())
}

/// The built-in performance, functionality and integration checks.
fn default_suite(scheduler: &Arc<AdaptiveScheduler>, monitor: &Arc<ResourceMonitor>) -> Vec<TaskRef> {
    let m = Arc::clone(monitor);
    let performance: TaskRef = Arc::new(FnTask::new("performance", move || {
        let monitor = Arc::clone(&m);
        async move {
            let Some(sample) = monitor.latest_sample() else {
                return Ok(());
            };
            let limit = monitor.config().high_cpu_threshold;
            if sample.cpu_usage_percent > limit {
                return Err(TaskError::failed(format!(
                    "CPU usage {:.1}% above {:.1}%",
                    sample.cpu_usage_percent, limit
                )));
            }
            Ok(())
        }
    }));

    let s = Arc::downgrade(scheduler);
    let functionality: TaskRef = Arc::new(FnTask::new("functionality", move || {
        let scheduler = s.clone();
        async move {
            let scheduler = scheduler
                .upgrade()
                .ok_or_else(|| TaskError::failed("scheduler dropped"))?;
            serde_json::to_string(&scheduler.status())
                .map(|_| ())
                .map_err(|e| TaskError::failed(format!("status not serializable: {}", e)))
        }
    }));

    let m = Arc::clone(monitor);
    let integration: TaskRef = Arc::new(FnTask::new("integration", move || {
        let monitor = Arc::clone(&m);
        async move {
            let idle = monitor.idle_time();
            let window = Duration::from_secs_f64(monitor.config().max_stall_secs);
            if idle > window {
                return Err(TaskError::failed(format!(
                    "no activity for {:.1}s",
                    idle.as_secs_f64()
                )));
            }
            Ok(())
        }
    }));

    vec![performance, functionality, integration]
}
