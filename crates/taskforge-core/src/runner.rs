//! RunSupervisor: owns the single external-process slot.
//!
//! At most one agent process is ever live per daemon instance. That is
//! enforced structurally: `current` is a single slot, not a collection, and
//! the tick loop is single-threaded. Process completion is observed via
//! `try_wait`, never a blocking wait, so the loop stays responsive to cutover
//! requests while a run is active.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use taskforge_schema::{now_stamp, CurrentRun, QueueItem, RunState, SessionMeta};
use taskforge_store::{write_json_atomic, ActivityLog, Workspace};
use taskforge_transport::MessageTransport;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::{WorkerConfig, SESSION_MARKER_FILE, TASK_GUIDE_FILE};
use crate::queue::RunQueue;
use crate::registry::TaskRegistry;
use crate::util::strip_ansi;

const RELAY_TAIL_BYTES: usize = 8000;
const SESSION_TRANSPORT: &str = "claude_cli";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    CuttingOver,
}

struct ActiveRun {
    child: Child,
    run: CurrentRun,
}

pub struct RunSupervisor {
    config: WorkerConfig,
    workspace: Workspace,
    transport: Arc<dyn MessageTransport>,
    activity: ActivityLog,
    current: Option<ActiveRun>,
    cutover_reason: Option<String>,
}

impl RunSupervisor {
    pub fn new(config: WorkerConfig, transport: Arc<dyn MessageTransport>) -> Self {
        let workspace = config.workspace();
        let activity = ActivityLog::new(
            workspace.activity_file(),
            config.activity_max_bytes,
            config.activity_backup_count,
            config.activity_retention_days,
        );
        Self {
            config,
            workspace,
            transport,
            activity,
            current: None,
            cutover_reason: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        match (&self.current, &self.cutover_reason) {
            (None, _) => RunnerState::Idle,
            (Some(_), None) => RunnerState::Running,
            (Some(_), Some(_)) => RunnerState::CuttingOver,
        }
    }

    pub fn current_run(&self) -> Option<&CurrentRun> {
        self.current.as_ref().map(|active| &active.run)
    }

    /// Clear run state left behind by an instance that died mid-run. The
    /// abandoned run's output is not resumed; the loop proceeds from IDLE.
    pub fn recover_stale_state(&self) -> Result<bool> {
        let path = self.workspace.current_run_file();
        let stale: serde_json::Value =
            taskforge_store::read_json_or(&path, serde_json::Value::Null);
        let had_stale = stale.as_object().map(|o| !o.is_empty()).unwrap_or(false);
        if had_stale {
            warn!("clearing stale current_run state from a previous instance");
            self.clear_run_state();
        }
        Ok(had_stale)
    }

    /// Request a hard cutover if the given task switch targets a different
    /// task than the one currently running for that chat.
    pub fn request_cutover(&mut self, chat_id: i64, target_task_id: &str, reason: &str) {
        let Some(active) = &self.current else {
            return;
        };
        if active.run.chat_id != chat_id || active.run.task_id == target_task_id {
            return;
        }
        info!(
            chat_id,
            target = target_task_id,
            reason,
            "cutover requested"
        );
        self.cutover_reason = Some(format!("{reason}: chat={chat_id} task={target_task_id}"));
    }

    pub async fn tick(&mut self, registry: &mut TaskRegistry, queue: &mut RunQueue) -> Result<()> {
        if self.current.is_some() {
            self.sync_runner_pid();
            if let Some(reason) = self.cutover_reason.take() {
                self.terminate_current(registry, &reason).await?;
                return Ok(());
            }
        }

        if let Some(mut active) = self.current.take() {
            match active.child.try_wait()? {
                None => {
                    self.current = Some(active);
                    return Ok(());
                }
                Some(status) => {
                    let exit_code = exit_code_of(status);
                    self.clear_run_state();
                    self.on_run_finished(registry, active.run, exit_code).await;
                    return Ok(());
                }
            }
        }

        let Some(item) = queue.pop()? else {
            return Ok(());
        };

        if let Some(active_id) = registry.active_task(item.chat_id) {
            if active_id != item.task_id {
                // Stale item from a previous task selection; dropped, never run.
                info!(
                    chat_id = item.chat_id,
                    message_id = item.message_id,
                    task = %item.task_id,
                    active = active_id,
                    "dropping stale queue item"
                );
                self.activity.append(&format!(
                    "[{}] drop stale queue item msg={} task={} active={}",
                    now_stamp(),
                    item.message_id,
                    item.task_id,
                    active_id
                ))?;
                return Ok(());
            }
        }

        let task_dir = self.workspace.task_dir(item.chat_id, &item.task_id);
        if !task_dir.exists() {
            warn!(task = %item.task_id, "task dir missing; recreating record");
            registry.ensure_task_with_ids(
                item.chat_id,
                &item.text,
                item.message_id,
                &item.timestamp,
                &item.task_id,
                &item.session_key,
            )?;
        }

        self.start_run(item).await
    }

    async fn start_run(&mut self, item: QueueItem) -> Result<()> {
        let task_dir = self.workspace.task_dir(item.chat_id, &item.task_id);
        std::fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create {}", task_dir.display()))?;

        let guide = task_dir.join(TASK_GUIDE_FILE);
        let marker = task_dir.join(SESSION_MARKER_FILE);
        let use_continue = marker.exists();
        let prompt = build_run_prompt(&item);

        let logs_dir = self.workspace.logs_dir();
        std::fs::create_dir_all(&logs_dir)?;
        let log_path = logs_dir.join(format!(
            "claude-run-{}.log",
            Local::now().format("%Y-%m-%d")
        ));
        let start_marker = format!(
            "START task={} chat={} msg={}",
            item.task_id, item.chat_id, item.message_id
        );
        {
            use std::io::Write;
            let mut header = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            writeln!(header, "\n[{}] {}", now_stamp(), start_marker)?;
        }
        let log_out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log_out.try_clone()?;

        let mut cmd = Command::new(&self.config.agent_exe);
        cmd.arg("-p")
            .arg("--model")
            .arg(&self.config.model)
            .arg("--effort")
            .arg(&self.config.effort);
        if use_continue {
            cmd.arg("-c");
        }
        cmd.arg("--dangerously-skip-permissions");
        if guide.exists() {
            cmd.arg("--append-system-prompt-file").arg(&guide);
        }
        cmd.arg(&prompt)
            .current_dir(&task_dir)
            .env("DISABLE_AUTOUPDATER", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_out))
            .stderr(Stdio::from(log_err));

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                // Launch failure never occupies the run slot.
                warn!(task = %item.task_id, "failed to start agent process: {err}");
                self.send_best_effort(
                    item.chat_id,
                    &format!(
                        "Could not start the run for task {}: {err}",
                        item.task_id
                    ),
                )
                .await;
                return Ok(());
            }
        };

        let run = CurrentRun {
            task_id: item.task_id.clone(),
            session_key: item.session_key.clone(),
            chat_id: item.chat_id,
            message_id: item.message_id,
            started_at: now_stamp(),
            task_dir: task_dir.to_string_lossy().into_owned(),
            queue_id: item.queue_id.clone(),
            log_file: log_path.to_string_lossy().into_owned(),
            log_start_marker: start_marker,
        };

        std::fs::write(&marker, &run.started_at)?;
        write_json_atomic(&self.workspace.current_run_file(), &run)?;
        self.save_session_meta(&run, RunState::Running, None);

        let pid = child.id().unwrap_or_default();
        self.current = Some(ActiveRun { child, run });
        self.sync_runner_pid();
        self.activity.append(&format!(
            "[{}] run started pid={} task={} chat={} msg={} continue={}",
            now_stamp(),
            pid,
            item.task_id,
            item.chat_id,
            item.message_id,
            use_continue
        ))?;
        info!(
            pid,
            task = %item.task_id,
            chat_id = item.chat_id,
            message_id = item.message_id,
            continue_session = use_continue,
            "run started"
        );
        Ok(())
    }

    /// Hard cutover: SIGTERM, bounded grace, SIGKILL. The process is confirmed
    /// not-alive before the run slot and on-disk state are cleared.
    pub async fn terminate_current(
        &mut self,
        registry: &TaskRegistry,
        reason: &str,
    ) -> Result<()> {
        self.cutover_reason = None;
        let Some(mut active) = self.current.take() else {
            return Ok(());
        };
        let pid = active.child.id();
        info!(pid, reason, task = %active.run.task_id, "terminating current run");

        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + self.config.term_grace;
        let mut exit_code = None;
        while Instant::now() < deadline {
            if let Some(status) = active.child.try_wait()? {
                exit_code = Some(exit_code_of(status));
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        if exit_code.is_none() {
            let _ = active.child.kill().await;
            exit_code = active.child.try_wait()?.map(exit_code_of);
        }
        let exit_code = exit_code.unwrap_or(-9);

        self.clear_run_state();

        let run = active.run;
        if let Err(err) = registry.record_change(
            run.chat_id,
            &run.task_id,
            run.message_id,
            &format!("run terminated ({reason})"),
            &format!("interrupted by task switch/shutdown: {reason}"),
        ) {
            warn!("failed to journal termination for {}: {err:#}", run.task_id);
        }
        self.save_session_meta(&run, RunState::Terminated(reason.to_string()), Some(exit_code));
        self.activity.append(&format!(
            "[{}] run terminated task={} reason={} exit={}",
            now_stamp(),
            run.task_id,
            reason,
            exit_code
        ))?;
        Ok(())
    }

    async fn on_run_finished(&mut self, registry: &TaskRegistry, run: CurrentRun, exit_code: i32) {
        let state = if exit_code == 0 { "success" } else { "error" };
        let summary = if exit_code == 0 {
            "request handled".to_string()
        } else {
            format!("run failed (exit={exit_code})")
        };

        if let Err(err) = registry.record_change(
            run.chat_id,
            &run.task_id,
            run.message_id,
            &format!("run finished ({state})"),
            &summary,
        ) {
            warn!("failed to journal run finish for {}: {err:#}", run.task_id);
        }

        if exit_code == 0 {
            self.relay_output(&run).await;
        } else {
            self.send_best_effort(
                run.chat_id,
                &format!(
                    "The run for this request failed.\n- task_id: {}\n- exit: {exit_code}",
                    run.task_id
                ),
            )
            .await;
        }

        let task_dir = Path::new(&run.task_dir);
        if let Err(err) = registry.sync_meta_on_finish(task_dir, exit_code) {
            warn!("failed to update task meta for {}: {err:#}", run.task_id);
        }
        self.save_session_meta(&run, RunState::Finished, Some(exit_code));
        if let Err(err) = self.activity.append(&format!(
            "[{}] run finished task={} chat={} msg={} exit={}",
            now_stamp(),
            run.task_id,
            run.chat_id,
            run.message_id,
            exit_code
        )) {
            warn!("activity log append failed: {err:#}");
        }
        info!(
            task = %run.task_id,
            chat_id = run.chat_id,
            exit_code,
            "run finished"
        );
    }

    async fn relay_output(&self, run: &CurrentRun) {
        let text = match std::fs::read_to_string(&run.log_file) {
            Ok(content) => extract_run_output(&content, &run.log_start_marker),
            Err(_) => String::new(),
        };
        if text.is_empty() {
            self.send_best_effort(run.chat_id, "Request completed.").await;
            return;
        }
        if let Err(err) = self
            .transport
            .send_chunked(run.chat_id, &text, self.config.relay_chunk_len)
            .await
        {
            warn!(chat_id = run.chat_id, "output relay failed: {err}");
        }
    }

    async fn send_best_effort(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.transport.send_text(chat_id, text).await {
            warn!(chat_id, "send failed: {err}");
        }
    }

    fn save_session_meta(&self, run: &CurrentRun, state: RunState, exit_code: Option<i32>) {
        if !self.config.store_session_meta {
            return;
        }
        let meta = SessionMeta {
            transport: SESSION_TRANSPORT.to_string(),
            model: self.config.model.clone(),
            reasoning_effort: self.config.effort.clone(),
            chat_id: run.chat_id,
            task_id: run.task_id.clone(),
            thread_id: run.session_key.clone(),
            message_id: run.message_id,
            state: state.label(),
            exit_code,
            updated_at: now_stamp(),
        };
        if let Err(err) = write_json_atomic(&self.workspace.session_meta_file(), &meta) {
            warn!("failed to write session meta: {err:#}");
        }
    }

    /// `current_run.json` holds `{}` while idle; `claude-runner.pid` exists
    /// only while a process is live.
    fn clear_run_state(&self) {
        if let Err(err) =
            write_json_atomic(&self.workspace.current_run_file(), &serde_json::json!({}))
        {
            warn!("failed to clear current_run state: {err:#}");
        }
        let _ = std::fs::remove_file(self.workspace.runner_pid_file());
    }

    fn sync_runner_pid(&self) {
        let pid_path = self.workspace.runner_pid_file();
        match self.current.as_ref().and_then(|active| active.child.id()) {
            Some(pid) => {
                let _ = std::fs::write(&pid_path, pid.to_string());
            }
            None => {
                let _ = std::fs::remove_file(&pid_path);
            }
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(9))
}

fn build_run_prompt(item: &QueueItem) -> String {
    let mut lines = vec![
        "A new chat message has arrived for this task session.".to_string(),
        "Handle only this one message in the current task context.".to_string(),
        format!("[CHAT_ID] {}", item.chat_id),
        format!("[TASK_ID] {}", item.task_id),
        format!("[SESSION_KEY] {}", item.session_key),
        format!("[MESSAGE_ID] {}", item.message_id),
        format!("[TIMESTAMP] {}", item.timestamp),
        "[USER_MESSAGE]".to_string(),
        if item.text.is_empty() {
            "(no text)".to_string()
        } else {
            item.text.clone()
        },
    ];

    if !item.files.is_empty() {
        lines.push("[FILES]".to_string());
        for file in &item.files {
            if !file.path.is_empty() {
                lines.push(format!("- {}: {}", file.kind, file.path));
            }
        }
    }
    if let Some(location) = &item.location {
        lines.push(format!(
            "[LOCATION] lat={}, lon={}",
            location.latitude, location.longitude
        ));
    }

    lines.push("When done, report the result to the user and exit.".to_string());
    lines.join("\n")
}

/// Extract this run's output from the dated log: everything after the run's
/// start marker line, falling back to the log tail when the marker is gone
/// (rotated away). CR/LF-normalized and ANSI-stripped.
fn extract_run_output(content: &str, marker: &str) -> String {
    let segment = if !marker.is_empty() {
        match content.rfind(marker) {
            Some(idx) => {
                let after = &content[idx + marker.len()..];
                match after.find('\n') {
                    Some(nl) => &after[nl + 1..],
                    None => "",
                }
            }
            None => tail_bytes(content, RELAY_TAIL_BYTES),
        }
    } else {
        tail_bytes(content, RELAY_TAIL_BYTES)
    };

    let normalized = segment.replace("\r\n", "\n").replace('\r', "\n");
    strip_ansi(&normalized).trim().to_string()
}

fn tail_bytes(content: &str, max: usize) -> &str {
    if content.len() <= max {
        return content;
    }
    let mut start = content.len() - max;
    while start < content.len() && !content.is_char_boundary(start) {
        start += 1;
    }
    &content[start..]
}
