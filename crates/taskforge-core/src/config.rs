//! Worker configuration.
//!
//! A worker is fully parameterized by its environment (the manager sets these
//! per spawned process); everything has a default so a bare `taskforge worker`
//! run in a scratch directory also works.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use taskforge_store::activity::{DEFAULT_BACKUP_COUNT, DEFAULT_MAX_BYTES, DEFAULT_RETENTION_DAYS};
use taskforge_store::Workspace;

pub const DEFAULT_MODEL: &str = "sonnet";
pub const DEFAULT_EFFORT: &str = "high";
pub const VALID_EFFORTS: [&str; 3] = ["low", "medium", "high"];
pub const DEFAULT_AGENT_EXE: &str = "claude";

/// Session marker written into a task directory on first run start; its
/// presence is what puts `-c` on every later invocation for that task.
pub const SESSION_MARKER_FILE: &str = ".claude_session_started";
/// Guide document seeded into every new task directory.
pub const TASK_GUIDE_FILE: &str = "CLAUDE.md";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub bot_id: String,
    pub workspace: Workspace,
    pub poll_interval: Duration,
    pub model: String,
    pub effort: String,
    pub agent_exe: String,
    pub log_retention_days: i64,
    pub activity_max_bytes: u64,
    pub activity_backup_count: usize,
    pub activity_retention_days: i64,
    /// Configuration only: cutover-on-switch is the sole cancellation trigger;
    /// no time-based preemption happens in the run loop.
    pub run_idle_timeout: Duration,
    pub store_session_meta: bool,
    /// SIGTERM grace before SIGKILL during cutover/shutdown.
    pub term_grace: Duration,
    pub relay_chunk_len: usize,
}

impl WorkerConfig {
    /// Defaults rooted at the given workspace.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            bot_id: String::new(),
            workspace: Workspace::new(root.into()),
            poll_interval: Duration::from_secs(1),
            model: DEFAULT_MODEL.to_string(),
            effort: DEFAULT_EFFORT.to_string(),
            agent_exe: DEFAULT_AGENT_EXE.to_string(),
            log_retention_days: DEFAULT_RETENTION_DAYS,
            activity_max_bytes: DEFAULT_MAX_BYTES,
            activity_backup_count: DEFAULT_BACKUP_COUNT,
            activity_retention_days: DEFAULT_RETENTION_DAYS,
            run_idle_timeout: Duration::from_secs(600),
            store_session_meta: true,
            term_grace: Duration::from_secs(8),
            relay_chunk_len: taskforge_transport::DEFAULT_CHUNK_LEN,
        }
    }

    /// Build from the worker environment contract.
    pub fn from_env() -> Result<Self> {
        let root = match env_string("TASKFORGE_WORKSPACE") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };

        let mut config = Self::for_workspace(root);
        if let Some(dir) = env_string("TASKFORGE_LOGS_DIR") {
            config.workspace = config.workspace.with_logs_dir(dir);
        }
        if let Some(dir) = env_string("TASKFORGE_TASKS_DIR") {
            config.workspace = config.workspace.with_tasks_dir(dir);
        }
        if let Some(dir) = env_string("TASKFORGE_STATE_DIR") {
            config.workspace = config.workspace.with_state_dir(dir);
        }
        if let Some(file) = env_string("TASKFORGE_MESSAGE_STORE") {
            config.workspace = config.workspace.with_message_store(file);
        }
        if let Some(bot_id) = env_string("TASKFORGE_BOT_ID") {
            config.bot_id = bot_id;
        }
        if let Some(secs) = env_u64("TASKFORGE_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(model) = env_string("TASKFORGE_CLAUDE_MODEL") {
            config.model = model;
        }
        if let Some(effort) = env_string("TASKFORGE_CLAUDE_EFFORT") {
            config.effort = normalize_effort(&effort);
        }
        config.agent_exe = detect_agent_exe();
        if let Some(days) = env_u64("TASKFORGE_LOG_RETENTION_DAYS") {
            config.log_retention_days = days.max(1) as i64;
        }
        if let Some(bytes) = env_u64("TASKFORGE_ACTIVITY_MAX_BYTES") {
            config.activity_max_bytes = bytes.max(1024);
        }
        if let Some(count) = env_u64("TASKFORGE_ACTIVITY_BACKUPS") {
            config.activity_backup_count = count as usize;
        }
        if let Some(days) = env_u64("TASKFORGE_ACTIVITY_RETENTION_DAYS") {
            config.activity_retention_days = days.max(1) as i64;
        }
        if let Some(secs) = env_u64("TASKFORGE_RUN_IDLE_TIMEOUT_SECS") {
            config.run_idle_timeout = Duration::from_secs(secs.max(60));
        }
        if let Some(flag) = env_bool("TASKFORGE_STORE_SESSION_META") {
            config.store_session_meta = flag;
        }
        if let Some(secs) = env_u64("TASKFORGE_TERM_GRACE_SECS") {
            config.term_grace = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }

    pub fn workspace(&self) -> Workspace {
        self.workspace.clone()
    }
}

/// Clamp an effort string to the supported set.
pub fn normalize_effort(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    if VALID_EFFORTS.contains(&lowered.as_str()) {
        lowered
    } else {
        DEFAULT_EFFORT.to_string()
    }
}

/// Resolve the agent executable: explicit env override, a well-known install
/// location, then a PATH probe; the bare name as a last resort.
pub fn detect_agent_exe() -> String {
    if let Some(exe) = env_string("CLAUDE_EXE") {
        return exe;
    }
    if let Some(home) = std::env::var_os("HOME") {
        let local = PathBuf::from(home).join(".local").join("bin").join(DEFAULT_AGENT_EXE);
        if local.exists() {
            return local.to_string_lossy().into_owned();
        }
    }
    if let Some(found) = probe_path(DEFAULT_AGENT_EXE) {
        return found;
    }
    DEFAULT_AGENT_EXE.to_string()
}

fn probe_path(name: &str) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_effort_accepts_valid_values() {
        assert_eq!(normalize_effort("low"), "low");
        assert_eq!(normalize_effort("  Medium "), "medium");
        assert_eq!(normalize_effort("HIGH"), "high");
    }

    #[test]
    fn normalize_effort_falls_back_on_garbage() {
        assert_eq!(normalize_effort("ultra"), DEFAULT_EFFORT);
        assert_eq!(normalize_effort(""), DEFAULT_EFFORT);
    }

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::for_workspace("/tmp/ws");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.effort, "high");
        assert!(config.store_session_meta);
        assert_eq!(config.workspace().root(), PathBuf::from("/tmp/ws"));
    }
}
