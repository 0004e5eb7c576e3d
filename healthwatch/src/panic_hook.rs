//! Process-wide panic reporting.
//!
//! Task and listener panics are caught by the scheduler and the event
//! registry, but the hook still runs first, so every panic is recorded in the
//! log with its location and thread.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::{Local, Utc};

use crate::logging::LOG_FILE_PREFIX;

/// Install a global panic hook that logs panics through `tracing`.
///
/// In `panic = "abort"` builds the record is also appended to the current
/// daily log file in `log_dir`, since the non-blocking writer may not flush
/// before the process aborts. The previous hook still runs afterwards.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::from_hook(panic_info);
            tracing::error!(
                target: "healthwatch::panic",
                thread = %record.thread,
                location = %record.location,
                "Panic: {}",
                record.payload
            );

            if cfg!(panic = "abort") {
                let _ = append_to_log(&log_dir, &record);
            }
        }));

        previous_hook(panic_info);
    }));
}

struct PanicRecord {
    thread: String,
    location: String,
    payload: String,
    backtrace: Backtrace,
}

impl PanicRecord {
    fn from_hook(info: &PanicHookInfo<'_>) -> Self {
        let payload = if let Some(s) = info.payload().downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            info.to_string()
        };

        Self {
            thread: thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload,
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} PANIC thread={} location={} payload={}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            self.thread,
            self.location,
            self.payload
        )?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

/// Append to the file `tracing_appender::rolling::daily` is currently writing.
fn append_to_log(log_dir: &Path, record: &PanicRecord) -> std::io::Result<()> {
    let filename = format!("{}.{}", LOG_FILE_PREFIX, Utc::now().format("%Y-%m-%d"));
    let path = PathBuf::from(log_dir).join(filename);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}
