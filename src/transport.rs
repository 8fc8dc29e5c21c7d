//! Chat transport seam.
//!
//! The bridge core only sees these traits and value types; the concrete
//! Telegram client lives behind them (see `telegram.rs`), and tests plug in
//! an in-memory implementation.

use async_trait::async_trait;
use thiserror::Error;

pub type ChannelId = i64;
pub type MessageId = i64;

/// Telegram's hard per-message limit after entity expansion.
pub const TRANSPORT_HARD_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub text: String,
}

impl RenderedMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub reply_to: Option<MessageRef>,
    pub notify: bool,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rate limited; retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    #[error("transport api error: {0}")]
    Api(String),

    #[error("transport closed")]
    Closed,
}

/// Message delivery. Rate-limit errors are retried inside the concrete
/// client; other errors surface as warnings and the run continues.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        channel_id: ChannelId,
        message: &RenderedMessage,
        options: SendOptions,
    ) -> Result<Option<MessageRef>, TransportError>;

    async fn edit(
        &self,
        target: MessageRef,
        message: &RenderedMessage,
    ) -> Result<Option<MessageRef>, TransportError>;

    async fn delete(&self, target: MessageRef) -> Result<bool, TransportError>;
}

/// A normalized incoming chat message.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: ChannelId,
    pub message_id: MessageId,
    pub text: String,
    pub reply_to_message_id: Option<MessageId>,
    pub reply_to_text: Option<String>,
    pub sender_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

/// Long-poll source of updates. `Closed` ends the bridge loop cleanly.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn poll(
        &self,
        offset: Option<i64>,
        timeout_s: u64,
    ) -> Result<Vec<Update>, TransportError>;
}
