//! Resource monitor: samples host metrics, tracks liveness and raises events.

mod liveness;
mod recovery;
mod service;
mod source;

pub use liveness::{ActivityHandle, Liveness};
pub use recovery::{NoopRecovery, RecoveryHooks};
pub use service::{ResourceMonitor, SystemStateSnapshot};
pub use source::{MetricsSource, ProcessSnapshot, SysinfoSource};
