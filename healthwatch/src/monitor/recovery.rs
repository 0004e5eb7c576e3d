//! Recovery actions run when a stall is detected.

/// Corrective actions the monitor invokes on a stall.
///
/// Implementations are provided by the host process. Errors are logged and do
/// not stop the remaining recovery steps.
pub trait RecoveryHooks: Send + Sync + 'static {
    /// Release non-essential cached resources.
    fn release_cached_resources(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Force a cleanup pass over transient allocations.
    fn force_cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Recovery hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecovery;

impl RecoveryHooks for NoopRecovery {}
