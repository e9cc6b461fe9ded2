//! Durable FIFO run queue: in-memory for the hot path, mirrored to
//! `state/task_queue.json` on every mutation, rehydrated on startup.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use taskforge_schema::QueueItem;
use taskforge_store::{read_json_or, write_json_atomic, Workspace};

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    items: Vec<QueueItem>,
}

#[derive(Debug)]
pub struct RunQueue {
    path: PathBuf,
    items: VecDeque<QueueItem>,
}

impl RunQueue {
    /// Rehydrate from disk, dropping rows that lost their identity.
    pub fn load(workspace: &Workspace) -> Self {
        let path = workspace.queue_file();
        let file: QueueFile = read_json_or(&path, QueueFile::default());
        let items = file
            .items
            .into_iter()
            .filter(|item| item.chat_id != 0 && !item.task_id.is_empty())
            .collect();
        Self { path, items }
    }

    pub fn push(&mut self, item: QueueItem) -> Result<()> {
        self.items.push_back(item);
        self.persist()
    }

    pub fn pop(&mut self) -> Result<Option<QueueItem>> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.persist()?;
        }
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    fn persist(&self) -> Result<()> {
        write_json_atomic(
            &self.path,
            &QueueFile {
                items: self.items.iter().cloned().collect(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_schema::new_queue_id;

    fn item(chat_id: i64, task_id: &str, message_id: i64) -> QueueItem {
        QueueItem {
            queue_id: new_queue_id(),
            chat_id,
            task_id: task_id.to_string(),
            session_key: task_id.trim_start_matches("thread_").to_string(),
            message_id,
            text: format!("message {message_id}"),
            timestamp: "2025-06-01 09:00:00".to_string(),
            files: vec![],
            location: None,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let mut queue = RunQueue::load(&ws);
        queue.push(item(1, "thread_a", 1)).unwrap();
        queue.push(item(1, "thread_a", 2)).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().message_id, 1);
        assert_eq!(queue.pop().unwrap().unwrap().message_id, 2);
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn queue_survives_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        {
            let mut queue = RunQueue::load(&ws);
            queue.push(item(1, "thread_a", 1)).unwrap();
            queue.push(item(2, "thread_b", 2)).unwrap();
        }
        let mut queue = RunQueue::load(&ws);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().unwrap().task_id, "thread_a");
    }

    #[test]
    fn load_drops_rows_without_identity() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let mut broken = item(0, "thread_a", 1);
        broken.chat_id = 0;
        let mut unnamed = item(3, "", 2);
        unnamed.task_id = String::new();
        write_json_atomic(
            &ws.queue_file(),
            &QueueFile {
                items: vec![broken, item(1, "thread_ok", 3), unnamed],
            },
        )
        .unwrap();

        let queue = RunQueue::load(&ws);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().task_id, "thread_ok");
    }

    #[test]
    fn pop_persists_immediately() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let mut queue = RunQueue::load(&ws);
        queue.push(item(1, "thread_a", 1)).unwrap();
        queue.pop().unwrap();

        let reloaded = RunQueue::load(&ws);
        assert!(reloaded.is_empty());
    }
}
