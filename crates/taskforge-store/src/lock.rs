//! Cross-process exclusivity: one daemon/manager instance per workspace.
//!
//! Backed by an advisory exclusive lock on a lock file plus a pid file for
//! operator tooling. The OS releases the lock when a holder dies, so a crashed
//! instance never wedges the workspace; a stale pid file left behind is
//! detected (process no longer alive) and cleaned up on the next acquire.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// `kill(pid, 0)` probes for existence without delivering a signal.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// RAII process lock: acquired at startup, held for the process lifetime,
/// released (and files removed) on drop.
pub struct ProcessLock {
    file: File,
    lock_path: PathBuf,
    pid_path: PathBuf,
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock")
            .field("lock_path", &self.lock_path)
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl ProcessLock {
    /// Acquire the exclusive lock or fail. Failure means another live instance
    /// owns this workspace and the caller must exit.
    pub fn acquire(lock_path: &Path, pid_path: &Path, owner: &str) -> Result<Self> {
        for path in [lock_path, pid_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        if let Some(stale) = read_pid(pid_path) {
            if stale != std::process::id() && !is_process_alive(stale) {
                tracing::info!("removing stale pid file (pid {stale} not running)");
                let _ = std::fs::remove_file(pid_path);
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;

        if !sys::try_lock_exclusive(&file)? {
            bail!("{owner} lock is busy: {}", lock_path.display());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        std::fs::write(pid_path, std::process::id().to_string())
            .with_context(|| format!("failed to write {}", pid_path.display()))?;

        Ok(Self {
            file,
            lock_path: lock_path.to_path_buf(),
            pid_path: pid_path.to_path_buf(),
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = sys::unlock(&self.file);
        let _ = std::fs::remove_file(&self.pid_path);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// OS lock backend, selected at compile time. Only the unix flock backend is
/// built today; adding another OS means adding a sibling module here, not
/// branching in callers.
#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_releases_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock_path = tmp.path().join("worker.lock");
        let pid_path = tmp.path().join("worker.pid");

        {
            let _lock = ProcessLock::acquire(&lock_path, &pid_path, "daemon").unwrap();
            let pid: u32 = std::fs::read_to_string(&pid_path)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert_eq!(pid, std::process::id());
        }

        assert!(!pid_path.exists());
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_in_same_process_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock_path = tmp.path().join("worker.lock");
        let pid_path = tmp.path().join("worker.pid");

        let _held = ProcessLock::acquire(&lock_path, &pid_path, "daemon").unwrap();
        let second = ProcessLock::acquire(&lock_path, &pid_path, "daemon");
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("lock is busy"));
    }

    #[test]
    fn stale_pid_file_is_cleaned_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lock_path = tmp.path().join("worker.lock");
        let pid_path = tmp.path().join("worker.pid");

        // Fake pid from a long-dead process; the lock itself was released by
        // the OS when that process died.
        std::fs::write(&pid_path, "99999999").unwrap();
        let _lock = ProcessLock::acquire(&lock_path, &pid_path, "daemon").unwrap();
        let pid: u32 = std::fs::read_to_string(&pid_path)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn is_process_alive_probes() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(99_999_999));
    }
}
