//! Adaptive scheduler: a bounded-retry maintenance queue run on a timer.

mod policy;
mod retry;
mod service;
mod task;

pub use policy::{FrameRatePolicy, FrameRateStatus, QualityControl, QualityLevel};
pub use retry::{RetryBudget, RetryDecision};
pub use service::{AdaptiveScheduler, MAX_RETRIES_REACHED, RunOutcome, SchedulerStatus};
pub use task::{FnTask, MaintenanceTask, TaskRef, execute};
