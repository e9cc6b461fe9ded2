//! Chat-transport seam.
//!
//! The daemon only ever talks to the chat platform through [`MessageTransport`]:
//! pull pending inbound messages, mark them processed, send text back. The wire
//! protocol itself lives outside this workspace; [`file_store::FileStoreTransport`]
//! implements the contract over a shared JSON message store.

pub mod chunk;
pub mod file_store;

use async_trait::async_trait;
use taskforge_schema::InboundMessage;

pub use chunk::split_chunks;
pub use file_store::FileStoreTransport;

/// Default chunk size for relayed run output.
pub const DEFAULT_CHUNK_LEN: usize = 3500;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("message store i/o: {0}")]
    Store(#[from] std::io::Error),
    #[error("malformed message store: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// All inbound messages not yet marked processed.
    async fn poll_pending(&self) -> Result<Vec<InboundMessage>, TransportError>;

    /// Mark consumed messages. Must be idempotent: re-marking already
    /// processed ids (or unknown ids) is a no-op.
    async fn mark_processed(&self, message_ids: &[i64]) -> Result<(), TransportError>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;

    /// Send long output as bounded chunks split at line/word boundaries.
    async fn send_chunked(
        &self,
        chat_id: i64,
        text: &str,
        max_len: usize,
    ) -> Result<usize, TransportError> {
        let chunks = split_chunks(text, max_len);
        for chunk in &chunks {
            self.send_text(chat_id, chunk).await?;
        }
        Ok(chunks.len())
    }
}
