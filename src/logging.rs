//! Structured logging module for FORME analysis
//!
//! Every line goes out as a `tracing` event. Once `init_logging` has been
//! called it is also appended to `<dir>/forme-YYYY-MM-DD.log`, categorized as:
//! - ROUTING: Orchestrator mode and fallback decisions
//! - REMOTE: Remote provider requests and stream decoding
//! - LOCAL: Local analyzer runs
//! - QUOTA: Ledger writes and usage alerts
//! - ERROR: Errors that were recovered from

use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Log categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Routing,
    Remote,
    Local,
    Quota,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Routing => "ROUTING",
            LogCategory::Remote => "REMOTE",
            LogCategory::Local => "LOCAL",
            LogCategory::Quota => "QUOTA",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Directory log files are written to, unset until `init_logging`
static LOG_DIR: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

fn log_file_path(dir: &Path) -> PathBuf {
    let today = Local::now().format("%Y-%m-%d").to_string();
    dir.join(format!("forme-{}.log", today))
}

/// Initialize file logging - creates the log directory if needed
pub fn init_logging(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }

    *LOG_DIR.lock().unwrap_or_else(PoisonError::into_inner) = Some(dir.to_path_buf());

    log(LogCategory::Routing, None, "FORME analysis logging initialized");

    Ok(())
}

/// Format one log line with category and optional request context
fn format_line(category: LogCategory, request_id: Option<&str>, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let req_context = request_id
        .map(|id| format!("request={} | ", id.chars().take(8).collect::<String>()))
        .unwrap_or_default();

    format!(
        "[{}] [{}] {}{}\n",
        timestamp,
        category.as_str(),
        req_context,
        message
    )
}

/// Log a message with category and optional request context
pub fn log(category: LogCategory, request_id: Option<&str>, message: &str) {
    match category {
        LogCategory::Error => tracing::error!(category = category.as_str(), request_id, "{}", message),
        _ => tracing::info!(category = category.as_str(), request_id, "{}", message),
    }

    let dir = LOG_DIR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let Some(dir) = dir else {
        return;
    };

    let line = format_line(category, request_id, message);
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(&dir))
    {
        let _ = file.write_all(line.as_bytes());
    }
}

/// Log a routing decision (mode, provider chosen, fallback taken)
pub fn log_routing(request_id: Option<&str>, message: &str) {
    log(LogCategory::Routing, request_id, message);
}

/// Log a remote provider event
pub fn log_remote(request_id: Option<&str>, message: &str) {
    log(LogCategory::Remote, request_id, message);
}

/// Log a local analyzer event
pub fn log_local(request_id: Option<&str>, message: &str) {
    log(LogCategory::Local, request_id, message);
}

/// Log a ledger event
pub fn log_quota(request_id: Option<&str>, message: &str) {
    log(LogCategory::Quota, request_id, message);
}

/// Log an error
pub fn log_error(request_id: Option<&str>, message: &str) {
    log(LogCategory::Error, request_id, message);
}

/// Clean up log files older than `keep_days`
pub fn cleanup_old_logs(dir: &Path, keep_days: i64) -> std::io::Result<usize> {
    let mut deleted = 0;

    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(keep_days);

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("forme-") && n.ends_with(".log"))
            .unwrap_or(false);
        if !is_log {
            continue;
        }

        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified_time: chrono::DateTime<Utc> = modified.into();
            if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_truncates_request_id() {
        let line = format_line(LogCategory::Quota, Some("abcdef0123456789"), "recorded 10 units");
        assert!(line.contains("[QUOTA]"));
        assert!(line.contains("request=abcdef01 | "));
        assert!(line.ends_with("recorded 10 units\n"));
    }

    #[test]
    fn test_format_line_without_context() {
        let line = format_line(LogCategory::Routing, None, "local-only");
        assert!(line.contains("[ROUTING] local-only"));
    }

    #[test]
    fn test_init_writes_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(dir.path()).unwrap();
        log_remote(Some("req-1"), "stream opened");

        let contents = fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert!(contents.contains("[REMOTE] request=req-1 | stream opened"));
    }

    #[test]
    fn test_cleanup_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        fs::write(dir.path().join("forme-2020-01-01.log"), "fresh").unwrap();

        // Files were just written, so nothing is past the window
        assert_eq!(cleanup_old_logs(dir.path(), 7).unwrap(), 0);
        assert!(dir.path().join("notes.txt").exists());
    }
}
