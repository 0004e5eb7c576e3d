//! healthwatch library crate.
//!
//! Two cooperating components run on independent timers:
//! - [`monitor::ResourceMonitor`] samples host metrics, tracks liveness and
//!   publishes threshold and stall events.
//! - [`scheduler::AdaptiveScheduler`] drains a queue of maintenance tasks with
//!   a global retry budget and lowers a quality setting under pressure.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod panic_hook;
pub mod scheduler;

pub use error::{Error, Result, TaskError};
