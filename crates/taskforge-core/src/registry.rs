//! Task bookkeeping: one record per logical unit of work, a per-chat task
//! index for selection/search, and the active-task map that decides which
//! task a chat's next message belongs to.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use taskforge_schema::{
    new_session_key, now_stamp, session_key_from_task_id, task_id_for_session, TaskChange,
    TaskIndexRow, TaskMeta,
};
use taskforge_store::{read_json_or, write_json_atomic, Workspace};
use tracing::{info, warn};

use crate::config::TASK_GUIDE_FILE;
use crate::util::{compact_space, truncate};

const TITLE_MAX_CHARS: usize = 52;
const CHANGES_FILE: &str = "changes.jsonl";
const SESSION_MODE: &str = "claude_cli";

#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub session_key: String,
    pub task_dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskIndex {
    #[serde(default)]
    tasks: Vec<TaskIndexRow>,
}

pub struct TaskRegistry {
    workspace: Workspace,
    active: HashMap<String, String>,
}

impl TaskRegistry {
    pub fn load(workspace: Workspace) -> Self {
        let raw: HashMap<String, String> = read_json_or(&workspace.active_tasks_file(), HashMap::new());
        let active = raw
            .into_iter()
            .filter(|(chat, task)| !chat.trim().is_empty() && !task.trim().is_empty())
            .collect();
        Self { workspace, active }
    }

    pub fn active_task(&self, chat_id: i64) -> Option<&str> {
        self.active.get(&chat_id.to_string()).map(String::as_str)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn set_active(&mut self, chat_id: i64, task_id: &str) -> Result<()> {
        self.active.insert(chat_id.to_string(), task_id.to_string());
        write_json_atomic(&self.workspace.active_tasks_file(), &self.active)
    }

    /// Per-chat index, most recently touched task first.
    pub fn task_index(&self, chat_id: i64) -> Vec<TaskIndexRow> {
        let index: TaskIndex = read_json_or(&self.workspace.chat_index_file(chat_id), TaskIndex::default());
        let mut rows = index.tasks;
        rows.sort_by_key(|row| std::cmp::Reverse(row.order_key()));
        rows
    }

    /// Resolve a selector against this chat's tasks. Order is significant:
    /// exact task-id match wins over fuzzy text overlap, which wins over the
    /// numeric message-id fallback.
    pub fn find(&self, chat_id: i64, selector: &str) -> Option<TaskIndexRow> {
        let selector = selector.trim();
        if selector.is_empty() {
            return None;
        }

        let rows = self.task_index(chat_id);
        if rows.is_empty() {
            return None;
        }

        let normalized = selector
            .strip_prefix(taskforge_schema::SESSION_KEY_PREFIX)
            .map(task_id_for_session);
        for row in &rows {
            if row.task_id == selector || Some(&row.task_id) == normalized.as_ref() {
                return Some(row.clone());
            }
        }

        let needle = selector.to_lowercase();
        for row in &rows {
            let hay = format!(
                "{} {} {}",
                row.display_title.as_deref().unwrap_or(""),
                row.display_subtitle.as_deref().unwrap_or(""),
                row.instruction
            )
            .to_lowercase();
            if hay.contains(&needle) {
                return Some(row.clone());
            }
        }

        if let Ok(mid) = selector.parse::<i64>() {
            for row in &rows {
                if row.message_id == mid || row.latest_message_id == Some(mid) {
                    return Some(row.clone());
                }
            }
        }

        None
    }

    /// Switch the chat's active task to an existing one. Returns the matched
    /// row, or `None` when no task matches the selector.
    pub fn activate(&mut self, chat_id: i64, selector: &str) -> Result<Option<TaskIndexRow>> {
        let Some(row) = self.find(chat_id, selector) else {
            return Ok(None);
        };
        self.set_active(chat_id, &row.task_id)?;
        Ok(Some(row))
    }

    /// Return the chat's active task if its record is intact, otherwise
    /// create a fresh task and activate it.
    pub fn ensure_active_task(
        &mut self,
        chat_id: i64,
        seed_instruction: &str,
        message_id: i64,
        timestamp: &str,
    ) -> Result<TaskHandle> {
        if let Some(active_id) = self.active_task(chat_id).map(str::to_string) {
            if let Some(row) = self.find(chat_id, &active_id) {
                let task_dir = if row.task_dir.is_empty() {
                    self.workspace.task_dir(chat_id, &row.task_id)
                } else {
                    PathBuf::from(&row.task_dir)
                };
                return Ok(TaskHandle {
                    session_key: session_key_from_task_id(&row.task_id).to_string(),
                    task_id: row.task_id,
                    task_dir,
                });
            }
        }

        let handle = self.create_task_inner(chat_id, seed_instruction, message_id, timestamp, None)?;
        self.set_active(chat_id, &handle.task_id)?;
        Ok(handle)
    }

    /// Recreate a task record under known ids (self-healing for a queue item
    /// whose task directory vanished).
    pub fn ensure_task_with_ids(
        &mut self,
        chat_id: i64,
        seed_instruction: &str,
        message_id: i64,
        timestamp: &str,
        task_id: &str,
        session_key: &str,
    ) -> Result<TaskHandle> {
        let handle = self.create_task_inner(
            chat_id,
            seed_instruction,
            message_id,
            timestamp,
            Some((task_id.to_string(), session_key.to_string())),
        )?;
        self.set_active(chat_id, &handle.task_id)?;
        Ok(handle)
    }

    /// Unconditionally create a new task and activate it.
    pub fn create_new_task(
        &mut self,
        chat_id: i64,
        instruction: &str,
        message_id: i64,
        timestamp: &str,
    ) -> Result<TaskHandle> {
        let handle = self.create_task_inner(chat_id, instruction, message_id, timestamp, None)?;
        self.set_active(chat_id, &handle.task_id)?;
        Ok(handle)
    }

    fn create_task_inner(
        &mut self,
        chat_id: i64,
        instruction: &str,
        message_id: i64,
        timestamp: &str,
        forced: Option<(String, String)>,
    ) -> Result<TaskHandle> {
        let (task_id, session_key) = match forced {
            Some((task_id, session_key)) => (task_id, session_key),
            None => {
                let key = new_session_key();
                (task_id_for_session(&key), key)
            }
        };

        let task_dir = self.workspace.task_dir(chat_id, &task_id);
        std::fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create {}", task_dir.display()))?;

        self.sync_task_meta(&task_dir, &session_key)?;
        self.seed_guide(&task_dir, &task_id, &session_key)?;

        // Directory creation and index update form one logical unit: if the
        // index write fails the directory stays behind, and the next create
        // under the same ids repairs/reuses it.
        let index_path = self.workspace.chat_index_file(chat_id);
        let mut index: TaskIndex = read_json_or(&index_path, TaskIndex::default());
        let created_at = if timestamp.is_empty() { now_stamp() } else { timestamp.to_string() };
        match index.tasks.iter_mut().find(|row| row.task_id == task_id) {
            Some(row) => {
                if message_id > 0 {
                    row.latest_message_id = Some(row.order_key().max(message_id));
                }
            }
            None => index.tasks.push(TaskIndexRow {
                task_id: task_id.clone(),
                instruction: instruction.to_string(),
                display_title: Some(truncate(&compact_space(instruction), TITLE_MAX_CHARS)),
                display_subtitle: None,
                message_id,
                latest_message_id: (message_id > 0).then_some(message_id),
                created_at,
                task_dir: task_dir.to_string_lossy().into_owned(),
            }),
        }
        write_json_atomic(&index_path, &index)?;

        info!(chat_id, task_id = %task_id, dir = %task_dir.display(), "task created");
        Ok(TaskHandle {
            task_id,
            session_key,
            task_dir,
        })
    }

    fn sync_task_meta(&self, task_dir: &Path, session_key: &str) -> Result<()> {
        let meta_path = task_dir.join("task_meta.json");
        let now = now_stamp();
        let mut meta = read_json_or(
            &meta_path,
            TaskMeta {
                session_key: session_key.to_string(),
                session_mode: SESSION_MODE.to_string(),
                created_at: now.clone(),
                updated_at: now.clone(),
                last_exit_code: None,
                last_run_finished_at: None,
            },
        );
        meta.session_key = session_key.to_string();
        meta.session_mode = SESSION_MODE.to_string();
        meta.updated_at = now;
        write_json_atomic(&meta_path, &meta)
    }

    /// Record terminal run state on the task record.
    pub fn sync_meta_on_finish(&self, task_dir: &Path, exit_code: i32) -> Result<()> {
        let meta_path = task_dir.join("task_meta.json");
        let now = now_stamp();
        let mut meta = read_json_or(
            &meta_path,
            TaskMeta {
                session_key: String::new(),
                session_mode: SESSION_MODE.to_string(),
                created_at: now.clone(),
                updated_at: now.clone(),
                last_exit_code: None,
                last_run_finished_at: None,
            },
        );
        meta.last_exit_code = Some(exit_code);
        meta.last_run_finished_at = Some(now.clone());
        meta.updated_at = now;
        write_json_atomic(&meta_path, &meta)
    }

    fn seed_guide(&self, task_dir: &Path, task_id: &str, session_key: &str) -> Result<()> {
        let guide = task_dir.join(TASK_GUIDE_FILE);
        if guide.exists() {
            return Ok(());
        }
        let body = format!(
            "# TASK GUIDE\n\n\
             - task_id: {task_id}\n\
             - session_key: {session_key}\n\n\
             ## Operating Rules\n\
             - This folder is the dedicated workspace for this task session.\n\
             - Handle only the newly delivered message content for this run.\n\
             - Keep user-visible responses concise and practical.\n\
             - Save task artifacts inside this task folder.\n"
        );
        std::fs::write(&guide, body)
            .with_context(|| format!("failed to write {}", guide.display()))
    }

    /// Append to the task's change journal and bump its index recency. Journal
    /// failures are the caller's to log; index recency is best-effort.
    pub fn record_change(
        &self,
        chat_id: i64,
        task_id: &str,
        message_id: i64,
        change_note: &str,
        result_summary: &str,
    ) -> Result<()> {
        let task_dir = self.workspace.task_dir(chat_id, task_id);
        std::fs::create_dir_all(&task_dir)?;
        let change = TaskChange {
            task_id: task_id.to_string(),
            message_id,
            source_message_ids: if message_id > 0 { vec![message_id] } else { vec![] },
            change_note: change_note.to_string(),
            result_summary: result_summary.to_string(),
            at: now_stamp(),
        };
        let line = serde_json::to_string(&change)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(task_dir.join(CHANGES_FILE))?;
        writeln!(file, "{line}")?;

        if message_id > 0 {
            if let Err(err) = self.bump_index_recency(chat_id, task_id, message_id) {
                warn!("failed to bump index recency for {task_id}: {err:#}");
            }
        }
        Ok(())
    }

    fn bump_index_recency(&self, chat_id: i64, task_id: &str, message_id: i64) -> Result<()> {
        let index_path = self.workspace.chat_index_file(chat_id);
        let mut index: TaskIndex = read_json_or(&index_path, TaskIndex::default());
        let Some(row) = index.tasks.iter_mut().find(|row| row.task_id == task_id) else {
            return Ok(());
        };
        row.latest_message_id = Some(row.order_key().max(message_id));
        write_json_atomic(&index_path, &index)
    }
}
