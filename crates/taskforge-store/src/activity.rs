//! Rotating activity sink shared by the daemon loop and run output.
//!
//! Rotation is size-based with numbered backups (`file.1` is newest), plus an
//! age sweep over the backups. Dated daemon/run logs (`*-YYYY-MM-DD.log`) are
//! pruned separately by [`prune_dated_logs`].

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate};
use regex::Regex;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_BACKUP_COUNT: usize = 7;
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    retention_days: i64,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backup_count: usize, retention_days: i64) -> Self {
        Self {
            path: path.into(),
            max_bytes: max_bytes.max(1024),
            backup_count,
            retention_days: retention_days.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, rotating first if the file is over the size cap.
    pub fn append(&self, line: &str) -> Result<()> {
        self.rotate_if_needed()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_bytes {
            return Ok(());
        }
        if self.backup_count == 0 {
            let _ = std::fs::remove_file(&self.path);
            return Ok(());
        }

        let _ = std::fs::remove_file(self.backup_path(self.backup_count));
        for idx in (1..self.backup_count).rev() {
            let src = self.backup_path(idx);
            if src.exists() {
                let _ = std::fs::rename(&src, self.backup_path(idx + 1));
            }
        }
        let _ = std::fs::rename(&self.path, self.backup_path(1));
        Ok(())
    }

    /// Unlink the activity file and its backups once they age out.
    pub fn prune_aged(&self) {
        let cutoff = Local::now() - Duration::days(self.retention_days);
        let mut candidates = vec![self.path.clone()];
        for idx in 1..=self.backup_count {
            candidates.push(self.backup_path(idx));
        }
        for path in candidates {
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let modified: DateTime<Local> = modified.into();
            if modified < cutoff {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{name}.{idx}"))
    }
}

/// Remove dated `*.log` files older than the retention window. File names
/// carry the date (`worker-2025-06-01.log`); anything without one is kept.
pub fn prune_dated_logs(dir: &Path, retention_days: i64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let cutoff = Local::now().date_naive() - Duration::days(retention_days.max(1) - 1);
    let date_re = Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("static regex");

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(cap) = date_re.captures(&stem) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(&cap[1], "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_and_terminates_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ActivityLog::new(tmp.path().join("activity.log"), 4096, 2, 7);
        log.append("first").unwrap();
        log.append("second\n").unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn rotation_shifts_backups() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("activity.log");
        // max_bytes is clamped to 1024, so exceed that to force rotation.
        let log = ActivityLog::new(&path, 1024, 2, 7);
        log.append(&"x".repeat(1500)).unwrap();
        log.append("next generation").unwrap();

        assert!(path.exists());
        assert!(tmp.path().join("activity.log.1").exists());
        let current = std::fs::read_to_string(&path).unwrap();
        assert_eq!(current, "next generation\n");
    }

    #[test]
    fn rotation_without_backups_truncates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("activity.log");
        let log = ActivityLog::new(&path, 1024, 0, 7);
        log.append(&"x".repeat(1500)).unwrap();
        log.append("fresh").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
        assert!(!tmp.path().join("activity.log.1").exists());
    }

    #[test]
    fn prune_dated_logs_removes_old_keeps_recent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let old = tmp.path().join("worker-2000-01-01.log");
        let today = Local::now().format("%Y-%m-%d").to_string();
        let recent = tmp.path().join(format!("worker-{today}.log"));
        let undated = tmp.path().join("notes.log");
        for p in [&old, &recent, &undated] {
            std::fs::write(p, "line\n").unwrap();
        }

        prune_dated_logs(tmp.path(), 7);

        assert!(!old.exists());
        assert!(recent.exists());
        assert!(undated.exists());
    }
}
