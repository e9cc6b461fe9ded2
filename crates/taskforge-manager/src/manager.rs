//! MultiBotManager: one supervised worker OS process per active bot.
//!
//! Each tick recomputes the desired worker set from configuration, tears down
//! workers for deactivated bots, and replaces (never resumes) workers whose
//! process exited. The manager only looks at process liveness, never at
//! daemon-internal state. The poll interval itself throttles restart
//! frequency, so no extra backoff is applied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use taskforge_store::{prune_dated_logs, ProcessLock};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BotEntry, BotsConfig};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub home: PathBuf,
    pub config_path: PathBuf,
    /// Root under which each bot gets its own isolated workspace.
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
    pub poll_interval: Duration,
    pub log_retention_days: i64,
    /// Command line used to spawn one worker (the worker reads everything
    /// else from its environment).
    pub worker_command: Vec<String>,
    pub term_grace: Duration,
}

impl ManagerSettings {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let worker_exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "taskforge".to_string());
        Self {
            config_path: home.join("config").join("bots.yaml"),
            workspace_root: home.join("bots"),
            logs_dir: home.join("logs"),
            poll_interval: Duration::from_secs(1),
            log_retention_days: 7,
            worker_command: vec![worker_exe, "worker".to_string()],
            term_grace: Duration::from_secs(8),
            home,
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.home.join(".manager.lock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join(".manager.pid")
    }
}

struct WorkerEntry {
    child: Child,
    workspace: PathBuf,
    #[allow(dead_code)]
    spawned_at: DateTime<Utc>,
}

pub struct MultiBotManager {
    settings: ManagerSettings,
    workers: HashMap<String, WorkerEntry>,
    shutdown: CancellationToken,
}

impl MultiBotManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            workers: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_pid(&self, bot_id: &str) -> Option<u32> {
        self.workers.get(bot_id).and_then(|entry| entry.child.id())
    }

    pub async fn run(&mut self) -> Result<()> {
        let _lock = ProcessLock::acquire(
            &self.settings.lock_file(),
            &self.settings.pid_file(),
            "manager",
        )?;
        std::fs::create_dir_all(&self.settings.logs_dir)?;
        std::fs::create_dir_all(&self.settings.workspace_root)?;
        info!(
            config = %self.settings.config_path.display(),
            workspaces = %self.settings.workspace_root.display(),
            "manager started"
        );

        while !self.shutdown.is_cancelled() {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        let bot_ids: Vec<String> = self.workers.keys().cloned().collect();
        for bot_id in bot_ids {
            self.stop_worker(&bot_id, "manager_shutdown").await;
        }
        info!("manager stopped");
        Ok(())
    }

    pub async fn tick(&mut self) {
        prune_dated_logs(&self.settings.logs_dir, self.settings.log_retention_days);

        let config = match BotsConfig::load(&self.settings.config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!("bot config unavailable (will retry next tick): {err:#}");
                return;
            }
        };

        let desired: HashMap<String, BotEntry> = config
            .desired_bots()
            .into_iter()
            .map(|bot| (bot.bot_id.clone(), bot.clone()))
            .collect();

        let supervised: Vec<String> = self.workers.keys().cloned().collect();
        for bot_id in supervised {
            if !desired.contains_key(&bot_id) {
                self.stop_worker(&bot_id, "bot_deactivated").await;
            }
        }

        for bot in desired.values() {
            self.ensure_worker(bot, &config);
        }
    }

    /// Make sure a live worker exists for the bot, replacing a dead one with
    /// a fresh process bound to the same workspace.
    fn ensure_worker(&mut self, bot: &BotEntry, config: &BotsConfig) {
        let workspace = self.workspace_for(&bot.bot_id);

        if let Some(entry) = self.workers.get_mut(&bot.bot_id) {
            match entry.child.try_wait() {
                Ok(None) => return,
                Ok(Some(status)) => {
                    let tail = worker_log_tail(&entry.workspace.join("logs"), 6);
                    if tail.is_empty() {
                        warn!(bot_id = %bot.bot_id, code = status.code(), "worker exited; restarting");
                    } else {
                        warn!(
                            bot_id = %bot.bot_id,
                            code = status.code(),
                            worker_log_tail = %tail,
                            "worker exited; restarting"
                        );
                    }
                }
                Err(err) => {
                    warn!(bot_id = %bot.bot_id, "worker status probe failed: {err}; restarting");
                }
            }
            self.workers.remove(&bot.bot_id);
        }

        let env = match worker_env(bot, config, &workspace) {
            Ok(env) => env,
            Err(err) => {
                warn!(bot_id = %bot.bot_id, "failed to prepare worker workspace: {err:#}");
                return;
            }
        };

        let Some((program, args)) = self.settings.worker_command.split_first() else {
            warn!("empty worker command; cannot spawn workers");
            return;
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                info!(bot_id = %bot.bot_id, pid = child.id(), "worker started");
                self.workers.insert(
                    bot.bot_id.clone(),
                    WorkerEntry {
                        child,
                        workspace,
                        spawned_at: Utc::now(),
                    },
                );
            }
            Err(err) => {
                warn!(bot_id = %bot.bot_id, "failed to spawn worker: {err}");
            }
        }
    }

    async fn stop_worker(&mut self, bot_id: &str, reason: &str) {
        let Some(mut entry) = self.workers.remove(bot_id) else {
            return;
        };
        info!(bot_id, pid = entry.child.id(), reason, "stopping worker");

        if let Some(pid) = entry.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + self.settings.term_grace;
        loop {
            match entry.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                _ => break,
            }
        }
        let _ = entry.child.kill().await;
    }

    pub fn workspace_for(&self, bot_id: &str) -> PathBuf {
        self.settings.workspace_root.join(sanitize_bot_id(bot_id))
    }
}

/// File-system-safe workspace name for a bot id.
fn sanitize_bot_id(bot_id: &str) -> String {
    let cleaned: String = bot_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Build the worker environment contract and create the isolated workspace
/// directories it points at.
fn worker_env(
    bot: &BotEntry,
    config: &BotsConfig,
    workspace: &Path,
) -> Result<Vec<(String, String)>> {
    let logs_dir = workspace.join("logs");
    let tasks_dir = workspace.join("tasks");
    let state_dir = workspace.join("state");
    let messages_dir = workspace.join("messages");
    for dir in [&logs_dir, &tasks_dir, &state_dir, &messages_dir] {
        std::fs::create_dir_all(dir)?;
    }

    Ok(vec![
        ("TASKFORGE_BOT_ID".to_string(), bot.bot_id.clone()),
        (
            "TASKFORGE_WORKSPACE".to_string(),
            workspace.to_string_lossy().into_owned(),
        ),
        (
            "TASKFORGE_LOGS_DIR".to_string(),
            logs_dir.to_string_lossy().into_owned(),
        ),
        (
            "TASKFORGE_TASKS_DIR".to_string(),
            tasks_dir.to_string_lossy().into_owned(),
        ),
        (
            "TASKFORGE_STATE_DIR".to_string(),
            state_dir.to_string_lossy().into_owned(),
        ),
        (
            "TASKFORGE_MESSAGE_STORE".to_string(),
            messages_dir.join("messages.json").to_string_lossy().into_owned(),
        ),
        ("TASKFORGE_BOT_TOKEN".to_string(), bot.token.clone()),
        (
            "TASKFORGE_ALLOWED_USERS".to_string(),
            config.allowed_users_csv(),
        ),
    ])
}

/// Last lines of the newest log file in a worker's logs directory, folded
/// into one line for the manager's own log.
fn worker_log_tail(logs_dir: &Path, max_lines: usize) -> String {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return String::new();
    };
    let newest = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .max_by_key(|entry| {
            entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });
    let Some(newest) = newest else {
        return String::new();
    };
    let Ok(content) = std::fs::read_to_string(newest.path()) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bots_yaml(settings: &ManagerSettings, body: &str) {
        std::fs::create_dir_all(settings.config_path.parent().unwrap()).unwrap();
        std::fs::write(&settings.config_path, body).unwrap();
    }

    fn sleeper_settings(tmp: &tempfile::TempDir) -> ManagerSettings {
        let mut settings = ManagerSettings::new(tmp.path());
        settings.worker_command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 60".to_string(),
        ];
        settings.term_grace = Duration::from_secs(5);
        settings
    }

    const ONE_BOT: &str = r#"
allowed_users: [100]
bots:
  - bot_id: alpha
    token: "t-alpha"
    active: true
"#;

    #[test]
    fn sanitize_bot_id_strips_unsafe_chars() {
        assert_eq!(sanitize_bot_id("my bot/01"), "my_bot_01");
        assert_eq!(sanitize_bot_id("ok-id_1.2"), "ok-id_1.2");
        assert_eq!(sanitize_bot_id("  "), "unknown");
    }

    #[test]
    fn worker_env_creates_isolated_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bot = BotEntry {
            bot_id: "alpha".to_string(),
            token: "t".to_string(),
            active: true,
            bot_name: None,
        };
        let config = BotsConfig {
            allowed_users: vec![100, 200],
            bots: vec![bot.clone()],
        };
        let workspace = tmp.path().join("bots").join("alpha");
        let env = worker_env(&bot, &config, &workspace).unwrap();
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert!(workspace.join("logs").exists());
        assert!(workspace.join("state").exists());
        assert_eq!(get("TASKFORGE_BOT_ID"), "alpha");
        assert_eq!(get("TASKFORGE_ALLOWED_USERS"), "100,200");
        assert!(get("TASKFORGE_MESSAGE_STORE").ends_with("messages/messages.json"));
    }

    #[tokio::test]
    async fn spawns_and_restarts_dead_worker() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = sleeper_settings(&tmp);
        write_bots_yaml(&settings, ONE_BOT);
        let mut manager = MultiBotManager::new(settings);

        manager.tick().await;
        assert_eq!(manager.worker_count(), 1);
        let first_pid = manager.worker_pid("alpha").unwrap();

        // Kill the worker out from under the manager; the next tick replaces
        // it with a fresh process bound to the same workspace.
        unsafe {
            libc::kill(first_pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.tick().await;
        let second_pid = manager.worker_pid("alpha").unwrap();
        assert_ne!(first_pid, second_pid);
        assert_eq!(manager.worker_count(), 1);

        manager.stop_worker("alpha", "test_cleanup").await;
    }

    #[tokio::test]
    async fn deactivated_bot_worker_is_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = sleeper_settings(&tmp);
        write_bots_yaml(&settings, ONE_BOT);
        let mut manager = MultiBotManager::new(settings.clone());

        manager.tick().await;
        assert_eq!(manager.worker_count(), 1);

        write_bots_yaml(
            &settings,
            r#"
allowed_users: [100]
bots:
  - bot_id: alpha
    token: "t-alpha"
    active: false
"#,
        );
        manager.tick().await;
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn unreadable_config_keeps_existing_workers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = sleeper_settings(&tmp);
        write_bots_yaml(&settings, ONE_BOT);
        let mut manager = MultiBotManager::new(settings.clone());

        manager.tick().await;
        assert_eq!(manager.worker_count(), 1);

        std::fs::remove_file(&settings.config_path).unwrap();
        manager.tick().await;
        // Config failure is retried next tick; nothing is torn down blindly.
        assert_eq!(manager.worker_count(), 1);

        manager.stop_worker("alpha", "test_cleanup").await;
    }

    #[test]
    fn worker_log_tail_reads_newest_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("worker.log"), "one\ntwo\nthree\nfour\n").unwrap();

        let tail = worker_log_tail(&logs, 2);
        assert_eq!(tail, "three | four");
        assert_eq!(worker_log_tail(&tmp.path().join("missing"), 2), "");
    }
}
