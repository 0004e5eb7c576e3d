//! Deletion of expired daily log files.

use std::path::Path;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::LOG_FILE_PREFIX;

/// Date encoded in a rolled log file name (`healthwatch.log.YYYY-MM-DD`).
pub(super) fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete rolled log files dated more than `retention_days` ago.
///
/// Returns the number of deleted files.
pub(super) async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_date_parsing() {
        assert_eq!(
            log_file_date("healthwatch.log.2026-03-01"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(log_file_date("healthwatch.log"), None);
        assert_eq!(log_file_date("healthwatch.log.latest"), None);
        assert_eq!(log_file_date("other.log.2026-03-01"), None);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_logs() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let old = today - chrono::Duration::days(10);

        let recent_name = format!("healthwatch.log.{}", today.format("%Y-%m-%d"));
        let old_name = format!("healthwatch.log.{}", old.format("%Y-%m-%d"));
        for name in [&recent_name, &old_name, &"notes.txt".to_string()] {
            std::fs::write(dir.path().join(name), b"log").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), 7).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(dir.path().join(&recent_name).exists());
        assert!(!dir.path().join(&old_name).exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
