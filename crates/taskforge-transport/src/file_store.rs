//! File-backed transport: a JSON message store shared with the external chat
//! poller, plus a JSONL outbox for outbound text.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use taskforge_schema::InboundMessage;
use taskforge_store::{read_json_or, write_json_atomic};
use tracing::debug;

use crate::{MessageTransport, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub message: InboundMessage,
    #[serde(default)]
    pub from_bot: bool,
    #[serde(default)]
    pub processed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageStore {
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize)]
struct OutboxLine<'a> {
    chat_id: i64,
    text: &'a str,
    at: String,
}

#[derive(Debug, Clone)]
pub struct FileStoreTransport {
    store_path: PathBuf,
    outbox_path: PathBuf,
    allowed_chats: Option<Vec<i64>>,
}

impl FileStoreTransport {
    pub fn new(store_path: impl Into<PathBuf>, outbox_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            outbox_path: outbox_path.into(),
            allowed_chats: None,
        }
    }

    /// Restrict polling to the given chats (the worker isolation contract
    /// carries an allowed-user list; an empty list allows everyone).
    pub fn with_allowed_chats(mut self, chats: Vec<i64>) -> Self {
        self.allowed_chats = if chats.is_empty() { None } else { Some(chats) };
        self
    }

    fn load(&self) -> MessageStore {
        read_json_or(&self.store_path, MessageStore::default())
    }

    fn chat_allowed(&self, chat_id: i64) -> bool {
        match &self.allowed_chats {
            Some(chats) => chats.contains(&chat_id),
            None => true,
        }
    }
}

#[async_trait]
impl MessageTransport for FileStoreTransport {
    async fn poll_pending(&self) -> Result<Vec<InboundMessage>, TransportError> {
        let store = self.load();
        Ok(store
            .messages
            .into_iter()
            .filter(|m| !m.processed && !m.from_bot && self.chat_allowed(m.message.chat_id))
            .map(|m| m.message)
            .collect())
    }

    async fn mark_processed(&self, message_ids: &[i64]) -> Result<(), TransportError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut store = self.load();
        let mut changed = false;
        for stored in &mut store.messages {
            if !stored.processed && message_ids.contains(&stored.message.message_id) {
                stored.processed = true;
                changed = true;
            }
        }
        if changed {
            write_json_atomic(&self.store_path, &store)
                .map_err(|e| TransportError::Other(format!("{e:#}")))?;
        }
        Ok(())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.outbox_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&OutboxLine {
            chat_id,
            text,
            at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox_path)?;
        writeln!(file, "{line}")?;
        debug!(chat_id, chars = text.len(), "outbound text queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_schema::Attachment;

    fn seed_store(path: &std::path::Path, messages: Vec<StoredMessage>) {
        write_json_atomic(path, &MessageStore { messages }).unwrap();
    }

    fn msg(message_id: i64, chat_id: i64, text: &str) -> StoredMessage {
        StoredMessage {
            message: InboundMessage {
                message_id,
                chat_id,
                text: text.to_string(),
                timestamp: "2025-06-01 09:00:00".to_string(),
                files: vec![],
                location: None,
            },
            from_bot: false,
            processed: false,
        }
    }

    fn transport(tmp: &tempfile::TempDir) -> FileStoreTransport {
        FileStoreTransport::new(
            tmp.path().join("messages.json"),
            tmp.path().join("outbox.jsonl"),
        )
    }

    #[tokio::test]
    async fn poll_skips_processed_and_bot_messages() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        let mut done = msg(1, 10, "old");
        done.processed = true;
        let mut bot = msg(2, 10, "bot echo");
        bot.from_bot = true;
        seed_store(
            &tmp.path().join("messages.json"),
            vec![done, bot, msg(3, 10, "new")],
        );

        let pending = tx.poll_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, 3);
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        seed_store(
            &tmp.path().join("messages.json"),
            vec![msg(1, 10, "a"), msg(2, 10, "b")],
        );

        tx.mark_processed(&[1]).await.unwrap();
        assert_eq!(tx.poll_pending().await.unwrap().len(), 1);

        // Replay the same ids plus an unknown one: no change, no error.
        tx.mark_processed(&[1, 999]).await.unwrap();
        assert_eq!(tx.poll_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_store_polls_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        assert!(tx.poll_pending().await.unwrap().is_empty());
        tx.mark_processed(&[1]).await.unwrap();
    }

    #[tokio::test]
    async fn send_text_appends_outbox_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        tx.send_text(10, "hello").await.unwrap();
        tx.send_text(10, "  ").await.unwrap(); // blank: dropped
        tx.send_text(11, "world").await.unwrap();

        let content = std::fs::read_to_string(tmp.path().join("outbox.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["chat_id"], 10);
        assert_eq!(first["text"], "hello");
    }

    #[tokio::test]
    async fn send_chunked_splits_long_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        let long = "line\n".repeat(400);
        let sent = tx.send_chunked(10, &long, 500).await.unwrap();
        assert!(sent > 1);
        let content = std::fs::read_to_string(tmp.path().join("outbox.jsonl")).unwrap();
        assert_eq!(content.lines().count(), sent);
    }

    #[tokio::test]
    async fn allowed_chat_filter_applies_to_polling() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp).with_allowed_chats(vec![10]);
        seed_store(
            &tmp.path().join("messages.json"),
            vec![msg(1, 10, "allowed"), msg(2, 99, "stranger")],
        );

        let pending = tx.poll_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chat_id, 10);
    }

    #[tokio::test]
    async fn stored_message_round_trips_attachments() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tx = transport(&tmp);
        let mut with_file = msg(5, 10, "see attachment");
        with_file.message.files.push(Attachment {
            kind: "document".to_string(),
            path: "/tmp/report.pdf".to_string(),
        });
        seed_store(&tmp.path().join("messages.json"), vec![with_file]);

        let pending = tx.poll_pending().await.unwrap();
        assert_eq!(pending[0].files.len(), 1);
        assert_eq!(pending[0].files[0].kind, "document");
    }
}
