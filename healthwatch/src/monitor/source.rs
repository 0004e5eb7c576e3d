//! Host metrics sources.

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

use crate::{Error, Result};

/// Resource usage of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    /// Resident memory in bytes.
    pub resident_memory_bytes: u64,
    /// Virtual memory in bytes.
    pub virtual_memory_bytes: u64,
    /// Number of threads, where the platform reports it.
    pub thread_count: Option<usize>,
}

/// A provider of CPU and memory utilization.
///
/// Returning [`Error::MetricsUnavailable`] from [`sample`](MetricsSource::sample)
/// disables sampling for the owning monitor; any other error only skips the
/// current tick.
pub trait MetricsSource: Send + 'static {
    /// Current `(cpu_percent, memory_percent)`, both in 0-100.
    fn sample(&mut self) -> Result<(f32, f32)>;

    /// Resource usage of this process, used in diagnostic snapshots.
    fn process_snapshot(&mut self) -> Option<ProcessSnapshot> {
        None
    }
}

/// [`MetricsSource`] backed by `sysinfo`.
pub struct SysinfoSource {
    system: System,
    pid: Option<Pid>,
}

impl std::fmt::Debug for SysinfoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoSource").field("pid", &self.pid).finish()
    }
}

impl SysinfoSource {
    /// Initialize the source.
    ///
    /// Fails with [`Error::MetricsUnavailable`] on platforms `sysinfo` does not
    /// support, or when the host reports no memory at all.
    pub fn new() -> Result<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(Error::metrics_unavailable(
                "host platform is not supported by sysinfo",
            ));
        }

        let mut system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        if system.total_memory() == 0 {
            return Err(Error::metrics_unavailable("total memory reported as zero"));
        }

        // CPU usage is a delta between two refreshes; the first reading is always 0.
        system.refresh_cpu_all();

        let pid = sysinfo::get_current_pid().ok();
        debug!("Initialized sysinfo metrics source (pid={:?})", pid);

        Ok(Self { system, pid })
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self) -> Result<(f32, f32)> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_usage();
        let total_mem = self.system.total_memory();
        let used_mem = self.system.used_memory();
        if total_mem == 0 {
            return Err(Error::Other("total memory reported as zero".to_string()));
        }
        let mem = (used_mem as f64 / total_mem as f64 * 100.0) as f32;

        Ok((cpu.clamp(0.0, 100.0), mem.clamp(0.0, 100.0)))
    }

    fn process_snapshot(&mut self) -> Option<ProcessSnapshot> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;

        Some(ProcessSnapshot {
            pid: pid.as_u32(),
            resident_memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            thread_count: process.tasks().map(|tasks| tasks.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_source_reports_percentages() {
        // Hosts without sysinfo support report MetricsUnavailable instead.
        match SysinfoSource::new() {
            Ok(mut source) => {
                let (cpu, mem) = source.sample().unwrap();
                assert!((0.0..=100.0).contains(&cpu));
                assert!((0.0..=100.0).contains(&mem));
                assert!(mem > 0.0);
            }
            Err(e) => assert!(matches!(e, Error::MetricsUnavailable(_))),
        }
    }

    #[test]
    fn test_process_snapshot_for_current_process() {
        if let Ok(mut source) = SysinfoSource::new()
            && let Some(snapshot) = source.process_snapshot()
        {
            assert_eq!(snapshot.pid, std::process::id());
            assert!(snapshot.resident_memory_bytes > 0);
        }
    }
}
