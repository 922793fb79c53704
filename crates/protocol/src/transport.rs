//! Chat transport contract.
//!
//! The delivery pipeline and command router never talk to the chat platform
//! directly; they go through this trait. The production implementation is
//! the Telegram Bot API client in the bot crate, tests use an in-memory
//! recorder.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a chat transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("chat platform rejected the request: {0}")]
    Api(String),

    #[error("message to edit or delete no longer exists")]
    MessageGone,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Transient failures are retried by the caller on the next cycle;
    /// everything else aborts the single operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Http(_))
    }
}

/// Outbound operations against the chat platform.
///
/// `topic_id` is the forum topic the message lands in; `None` targets the
/// chat's general timeline. Sends return the platform message id so tool
/// results can later edit the tool-use message in place.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<i64, TransportError>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError>;

    /// Best-effort "typing…" indicator; failures are ignored by callers.
    async fn send_typing(&self, chat_id: i64, topic_id: Option<i64>) -> Result<(), TransportError>;
}
