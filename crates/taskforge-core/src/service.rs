//! Per-bot daemon: single-threaded cooperative loop tying together message
//! ingestion, task bookkeeping, the run queue, and the run supervisor.

use std::sync::Arc;

use anyhow::{Context, Result};
use taskforge_schema::{new_queue_id, now_stamp, CurrentRun, QueueItem};
use taskforge_store::{prune_dated_logs, ActivityLog, ProcessLock, Workspace};
use taskforge_transport::MessageTransport;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::{help_text, parse_command, Command};
use crate::config::WorkerConfig;
use crate::queue::RunQueue;
use crate::registry::TaskRegistry;
use crate::runner::{RunSupervisor, RunnerState};
use crate::util::{compact_space, truncate};

pub struct Daemon {
    config: WorkerConfig,
    workspace: Workspace,
    transport: Arc<dyn MessageTransport>,
    registry: TaskRegistry,
    queue: RunQueue,
    supervisor: RunSupervisor,
    activity: ActivityLog,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: WorkerConfig, transport: Arc<dyn MessageTransport>) -> Result<Self> {
        let workspace = config.workspace();
        workspace.ensure_dirs().context("failed to prepare workspace")?;

        let registry = TaskRegistry::load(workspace.clone());
        let queue = RunQueue::load(&workspace);
        let supervisor = RunSupervisor::new(config.clone(), transport.clone());
        let activity = ActivityLog::new(
            workspace.activity_file(),
            config.activity_max_bytes,
            config.activity_backup_count,
            config.activity_retention_days,
        );

        let daemon = Self {
            config,
            workspace,
            transport,
            registry,
            queue,
            supervisor,
            activity,
            shutdown: CancellationToken::new(),
        };

        // A non-null CurrentRun at boot means the previous instance died
        // mid-run: fatal to that run, not to the daemon.
        if daemon.supervisor.recover_stale_state()? {
            info!("recovered from stale run state left by a previous instance");
        }
        Ok(daemon)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn runner_state(&self) -> RunnerState {
        self.supervisor.state()
    }

    pub fn current_run(&self) -> Option<CurrentRun> {
        self.supervisor.current_run().cloned()
    }

    pub fn active_task(&self, chat_id: i64) -> Option<String> {
        self.registry.active_task(chat_id).map(str::to_string)
    }

    /// Main loop: hold the workspace lock for the process lifetime, then
    /// tick at a fixed interval until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let _lock = ProcessLock::acquire(
            &self.workspace.daemon_lock_file(),
            &self.workspace.daemon_pid_file(),
            "daemon worker",
        )?;
        info!(
            bot_id = %self.config.bot_id,
            workspace = %self.workspace.root().display(),
            model = %self.config.model,
            effort = %self.config.effort,
            "daemon started"
        );
        self.activity
            .append(&format!("[{}] daemon started", now_stamp()))?;

        while !self.shutdown.is_cancelled() {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.supervisor
            .terminate_current(&self.registry, "daemon_shutdown")
            .await?;
        info!("daemon stopped");
        Ok(())
    }

    /// One cooperative tick. Per-tick failures are logged and retried on the
    /// next tick; nothing here crashes the loop.
    pub async fn tick(&mut self) {
        self.prune_logs();
        if let Err(err) = self.ingest().await {
            warn!("ingest failed (will retry next tick): {err:#}");
        }
        if let Err(err) = self.supervisor.tick(&mut self.registry, &mut self.queue).await {
            warn!("run supervision failed (will retry next tick): {err:#}");
        }
    }

    fn prune_logs(&self) {
        prune_dated_logs(&self.workspace.logs_dir(), self.config.log_retention_days);
        self.activity.prune_aged();
    }

    /// Pull newly arrived messages in `(chat_id, message_id)` order; control
    /// commands run synchronously, everything else becomes a queue item.
    /// Messages are marked processed only after the whole batch is handled.
    async fn ingest(&mut self) -> Result<()> {
        let mut pending = self.transport.poll_pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by_key(|msg| (msg.chat_id, msg.message_id));

        let mut to_mark = Vec::new();
        for msg in pending {
            if msg.message_id <= 0 || msg.chat_id == 0 {
                continue;
            }
            let text = msg.text.trim().to_string();

            if let Some(command) = parse_command(&text) {
                self.handle_command(msg.chat_id, msg.message_id, command).await;
                to_mark.push(msg.message_id);
                continue;
            }

            let task = match self.registry.ensure_active_task(
                msg.chat_id,
                &text,
                msg.message_id,
                &msg.timestamp,
            ) {
                Ok(task) => task,
                Err(err) => {
                    warn!(chat_id = msg.chat_id, "task resolution failed: {err:#}");
                    self.send_best_effort(
                        msg.chat_id,
                        "Could not create or select a task. Please try again shortly.",
                    )
                    .await;
                    // Not marked processed: retried on the next tick.
                    continue;
                }
            };

            let timestamp = if msg.timestamp.is_empty() {
                now_stamp()
            } else {
                msg.timestamp.clone()
            };
            let item = QueueItem {
                queue_id: new_queue_id(),
                chat_id: msg.chat_id,
                task_id: task.task_id.clone(),
                session_key: task.session_key.clone(),
                message_id: msg.message_id,
                text,
                timestamp,
                files: msg.files,
                location: msg.location,
            };
            self.queue.push(item)?;
            to_mark.push(msg.message_id);

            self.send_best_effort(
                msg.chat_id,
                &format!("Request received. Queued under task {}.", task.task_id),
            )
            .await;
        }

        if !to_mark.is_empty() {
            self.transport.mark_processed(&to_mark).await?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, chat_id: i64, message_id: i64, command: Command) {
        match command {
            Command::TaskList { limit } => {
                let rows = self.registry.task_index(chat_id);
                let mut lines = vec![format!("Recent tasks (up to {limit})")];
                if rows.is_empty() {
                    lines.push("- no tasks yet".to_string());
                } else {
                    for (i, row) in rows.iter().take(limit).enumerate() {
                        let title = truncate(&compact_space(row.title()), 52);
                        lines.push(format!("{}. {} - {}", i + 1, row.task_id, title));
                    }
                }
                lines.push(String::new());
                lines.push("Resume: /task-activate <task_id>".to_string());
                lines.push("Start fresh: /task-new <summary>".to_string());
                self.send_best_effort(chat_id, &lines.join("\n")).await;
            }
            Command::TaskNew { seed } => {
                let instruction = if seed.is_empty() {
                    "(new task)".to_string()
                } else {
                    seed
                };
                match self
                    .registry
                    .create_new_task(chat_id, &instruction, message_id, &now_stamp())
                {
                    Ok(task) => {
                        self.supervisor
                            .request_cutover(chat_id, &task.task_id, "new_task");
                        self.send_best_effort(
                            chat_id,
                            &format!(
                                "Started a new task.\n- task_id: {}\n- workspace: {}\nFollow-up messages now run in this task session.",
                                task.task_id,
                                task.task_dir.display()
                            ),
                        )
                        .await;
                    }
                    Err(err) => {
                        warn!(chat_id, "new task creation failed: {err:#}");
                        self.send_best_effort(
                            chat_id,
                            "Could not create a new task. Please try again shortly.",
                        )
                        .await;
                    }
                }
            }
            Command::TaskActivate { selector } => {
                if selector.is_empty() {
                    self.send_best_effort(chat_id, "Usage: /task-activate <task_id|search>")
                        .await;
                    return;
                }
                match self.registry.activate(chat_id, &selector) {
                    Ok(Some(row)) => {
                        self.supervisor
                            .request_cutover(chat_id, &row.task_id, "task_activate");
                        if let Err(err) = self.registry.record_change(
                            chat_id,
                            &row.task_id,
                            message_id,
                            "task activated",
                            &format!("active task switched to {}", row.task_id),
                        ) {
                            warn!("failed to journal activation: {err:#}");
                        }
                        self.send_best_effort(
                            chat_id,
                            &format!(
                                "Continuing task.\n- task_id: {}\n- title: {}",
                                row.task_id,
                                truncate(&compact_space(row.title()), 52)
                            ),
                        )
                        .await;
                    }
                    Ok(None) => {
                        self.send_best_effort(
                            chat_id,
                            &format!("No matching task: {selector}"),
                        )
                        .await;
                    }
                    Err(err) => {
                        warn!(chat_id, "task activation failed: {err:#}");
                        self.send_best_effort(
                            chat_id,
                            "Task switch failed. Please try again shortly.",
                        )
                        .await;
                    }
                }
            }
            Command::Status => {
                let runner = match self.supervisor.state() {
                    RunnerState::Idle => "idle".to_string(),
                    RunnerState::Running | RunnerState::CuttingOver => self
                        .supervisor
                        .current_run()
                        .map(|run| format!("running {}", run.task_id))
                        .unwrap_or_else(|| "running".to_string()),
                };
                let lines = [
                    "taskforge status".to_string(),
                    format!("- time: {}", now_stamp()),
                    format!("- active tasks: {}", self.registry.active_count()),
                    format!("- queued requests: {}", self.queue.len()),
                    format!("- runner: {runner}"),
                ];
                self.send_best_effort(chat_id, &lines.join("\n")).await;
            }
            Command::Help => {
                self.send_best_effort(chat_id, &help_text()).await;
            }
        }
    }

    /// Terminate the in-flight run, if any. Used on shutdown paths.
    pub async fn terminate_current_run(&mut self, reason: &str) -> Result<()> {
        self.supervisor
            .terminate_current(&self.registry, reason)
            .await
    }

    async fn send_best_effort(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.transport.send_text(chat_id, text).await {
            warn!(chat_id, "send failed: {err}");
        }
    }
}
