use chrono::Local;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TASK_ID_PREFIX: &str = "thread_";
pub const SESSION_KEY_PREFIX: &str = "session_";

/// Timestamp format used in all persisted state files.
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time in the persisted-state format.
pub fn now_stamp() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

/// Mint a fresh session key: sortable timestamp prefix + random suffix.
pub fn new_session_key() -> String {
    let ts = Local::now().format("%Y%m%d%H%M%S");
    let uid = Uuid::new_v4().simple().to_string();
    format!("{ts}_{}", &uid[..12])
}

pub fn new_queue_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Task ids are derived from session keys (`thread_<session_key>`).
pub fn task_id_for_session(session_key: &str) -> String {
    format!("{TASK_ID_PREFIX}{session_key}")
}

pub fn session_key_from_task_id(task_id: &str) -> &str {
    task_id.strip_prefix(TASK_ID_PREFIX).unwrap_or(task_id)
}

/// One pending message from the chat transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub files: Vec<Attachment>,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(alias = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A unit of queued work: one inbound message bound to the task it was
/// ingested under. Immutable after creation; consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: String,
    pub chat_id: i64,
    pub task_id: String,
    pub session_key: String,
    pub message_id: i64,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub files: Vec<Attachment>,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Persisted as `<task_dir>/task_meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub session_key: String,
    pub session_mode: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub last_run_finished_at: Option<String>,
}

/// One row of the per-chat `index.json` task index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIndexRow {
    pub task_id: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub display_title: Option<String>,
    #[serde(default)]
    pub display_subtitle: Option<String>,
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub latest_message_id: Option<i64>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub task_dir: String,
}

impl TaskIndexRow {
    /// Message id used for recency ordering of the index.
    pub fn order_key(&self) -> i64 {
        self.latest_message_id.unwrap_or(self.message_id)
    }

    pub fn title(&self) -> &str {
        match self.display_title.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => &self.instruction,
        }
    }
}

/// The single live-run record, persisted as `state/current_run.json`.
/// Present on disk iff an external agent process is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentRun {
    pub task_id: String,
    pub session_key: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub started_at: String,
    pub task_dir: String,
    pub queue_id: String,
    pub log_file: String,
    pub log_start_marker: String,
}

/// Terminal-state label for a run, written into the session-meta record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    Finished,
    Terminated(String),
}

impl RunState {
    pub fn label(&self) -> String {
        match self {
            RunState::Running => "running".to_string(),
            RunState::Finished => "finished".to_string(),
            RunState::Terminated(reason) => format!("terminated:{reason}"),
        }
    }
}

/// Last known run, persisted as `logs/claude-session-current.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub transport: String,
    pub model: String,
    pub reasoning_effort: String,
    pub chat_id: i64,
    pub task_id: String,
    pub thread_id: String,
    pub message_id: i64,
    pub state: String,
    pub exit_code: Option<i32>,
    pub updated_at: String,
}

/// One line of a task's `changes.jsonl` journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChange {
    pub task_id: String,
    pub message_id: i64,
    #[serde(default)]
    pub source_message_ids: Vec<i64>,
    pub change_note: String,
    pub result_summary: String,
    pub at: String,
}
