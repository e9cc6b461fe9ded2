use std::path::{Path, PathBuf};

use anyhow::Result;

/// A Workspace is one bot's home directory — the single root for all of its
/// persistent state: task directories, queue/run state, message store, and logs.
/// The manager gives every worker its own workspace; nothing is shared.
///
/// Every directory derives from the root but can be overridden individually
/// (the manager parameterizes workers purely through the environment).
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    logs_dir: Option<PathBuf>,
    tasks_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    message_store: Option<PathBuf>,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            logs_dir: None,
            tasks_dir: None,
            state_dir: None,
            message_store: None,
        }
    }

    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }

    pub fn with_tasks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tasks_dir = Some(dir.into());
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_message_store(mut self, file: impl Into<PathBuf>) -> Self {
        self.message_store = Some(file.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for daemon and run logs (`logs/`).
    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(|| self.root.join("logs"))
    }

    /// Root for per-chat task directories (`tasks/`).
    pub fn tasks_dir(&self) -> PathBuf {
        self.tasks_dir.clone().unwrap_or_else(|| self.root.join("tasks"))
    }

    /// Directory for queue/run/active-task state files (`state/`).
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| self.root.join("state"))
    }

    /// Directory holding the transport message store (`messages/`).
    pub fn messages_dir(&self) -> PathBuf {
        match &self.message_store {
            Some(file) => file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.join("messages")),
            None => self.root.join("messages"),
        }
    }

    pub fn message_store_file(&self) -> PathBuf {
        self.message_store
            .clone()
            .unwrap_or_else(|| self.messages_dir().join("messages.json"))
    }

    pub fn outbox_file(&self) -> PathBuf {
        self.messages_dir().join("outbox.jsonl")
    }

    pub fn active_tasks_file(&self) -> PathBuf {
        self.state_dir().join("active_task_by_chat.json")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.state_dir().join("task_queue.json")
    }

    pub fn current_run_file(&self) -> PathBuf {
        self.state_dir().join("current_run.json")
    }

    /// Pid of the currently live external agent process, if any.
    pub fn runner_pid_file(&self) -> PathBuf {
        self.state_dir().join("claude-runner.pid")
    }

    pub fn session_meta_file(&self) -> PathBuf {
        self.logs_dir().join("claude-session-current.json")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.state_dir().join("daemon-worker.pid")
    }

    pub fn daemon_lock_file(&self) -> PathBuf {
        self.state_dir().join("daemon-worker.lock")
    }

    pub fn activity_file(&self) -> PathBuf {
        self.logs_dir().join("claude-runner.log")
    }

    pub fn chat_root(&self, chat_id: i64) -> PathBuf {
        self.tasks_dir().join(format!("chat_{chat_id}"))
    }

    pub fn chat_index_file(&self, chat_id: i64) -> PathBuf {
        self.chat_root(chat_id).join("index.json")
    }

    pub fn task_dir(&self, chat_id: i64, task_id: &str) -> PathBuf {
        self.chat_root(chat_id).join(task_id)
    }

    /// Create the standard directory layout if it does not exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.tasks_dir())?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.messages_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_derivations() {
        let ws = Workspace::new("/home/bot");
        assert_eq!(ws.logs_dir(), PathBuf::from("/home/bot/logs"));
        assert_eq!(ws.queue_file(), PathBuf::from("/home/bot/state/task_queue.json"));
        assert_eq!(
            ws.current_run_file(),
            PathBuf::from("/home/bot/state/current_run.json")
        );
        assert_eq!(
            ws.session_meta_file(),
            PathBuf::from("/home/bot/logs/claude-session-current.json")
        );
        assert_eq!(ws.chat_root(42), PathBuf::from("/home/bot/tasks/chat_42"));
        assert_eq!(
            ws.task_dir(42, "thread_abc"),
            PathBuf::from("/home/bot/tasks/chat_42/thread_abc")
        );
        assert_eq!(
            ws.message_store_file(),
            PathBuf::from("/home/bot/messages/messages.json")
        );
    }

    #[test]
    fn overrides_redirect_derived_paths() {
        let ws = Workspace::new("/home/bot")
            .with_logs_dir("/var/log/bot")
            .with_state_dir("/run/bot")
            .with_message_store("/srv/inbox/store.json");
        assert_eq!(
            ws.session_meta_file(),
            PathBuf::from("/var/log/bot/claude-session-current.json")
        );
        assert_eq!(ws.queue_file(), PathBuf::from("/run/bot/task_queue.json"));
        assert_eq!(ws.message_store_file(), PathBuf::from("/srv/inbox/store.json"));
        assert_eq!(ws.outbox_file(), PathBuf::from("/srv/inbox/outbox.jsonl"));
        // Tasks stay under the root when not overridden.
        assert_eq!(ws.tasks_dir(), PathBuf::from("/home/bot/tasks"));
    }

    #[test]
    fn negative_chat_ids_keep_sign() {
        let ws = Workspace::new("/home/bot");
        assert_eq!(
            ws.chat_root(-100123),
            PathBuf::from("/home/bot/tasks/chat_-100123")
        );
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let ws = Workspace::new(tmp.path().join("ws"));
        ws.ensure_dirs().expect("ensure_dirs");

        assert!(ws.logs_dir().exists());
        assert!(ws.tasks_dir().exists());
        assert!(ws.state_dir().exists());
        assert!(ws.messages_dir().exists());
    }
}
