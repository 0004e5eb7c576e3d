//! Configuration for the monitor, the scheduler and the host process.
//!
//! All values are plain numbers with documented units. They can be built in
//! code, deserialized with serde, or read from `HEALTHWATCH_*` environment
//! variables (see [`AppConfig::from_env`]).

mod env;
mod settings;

pub(crate) use settings::MIN_TEST_INTERVAL;
pub use settings::{AppConfig, MonitorConfig, SchedulerConfig};
