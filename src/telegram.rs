//! Telegram Bot API client.
//!
//! Thin HTTP implementation of the `Transport` and `UpdateSource` seams.
//! Rate limits (429 + `retry_after`) are retried here so the core never sees
//! them; other API errors bubble up as `TransportError::Api`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::transport::{
    ChannelId, IncomingMessage, MessageRef, RenderedMessage, SendOptions, Transport,
    TransportError, Update, UpdateSource,
};

const MAX_RATE_LIMIT_RETRIES: u32 = 5;

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    message_id: i64,
    chat: WireChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    from: Option<WireUser>,
    #[serde(default)]
    reply_to_message: Option<Box<WireMessage>>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: i64,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, TransportError> {
        let url = format!("{}/{method}", self.base_url);
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .http
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|err| TransportError::Api(err.to_string()))?;
            let body: ApiResponse = response
                .json()
                .await
                .map_err(|err| TransportError::Api(err.to_string()))?;
            if body.ok {
                return Ok(body.result.unwrap_or(Value::Null));
            }
            let retry_after = body.parameters.and_then(|p| p.retry_after);
            if let Some(retry_after_s) = retry_after {
                if attempt < MAX_RATE_LIMIT_RETRIES {
                    debug!(method, retry_after_s, "telegram.rate_limited");
                    tokio::time::sleep(Duration::from_secs(retry_after_s)).await;
                    continue;
                }
                return Err(TransportError::RateLimited { retry_after_s });
            }
            return Err(TransportError::Api(
                body.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Err(TransportError::Api("retry budget exhausted".to_string()))
    }
}

fn incoming_from_wire(message: WireMessage) -> Option<IncomingMessage> {
    let text = message.text.or(message.caption)?;
    let (reply_to_message_id, reply_to_text) = match message.reply_to_message {
        Some(reply) => (Some(reply.message_id), reply.text.clone()),
        None => (None, None),
    };
    Some(IncomingMessage {
        chat_id: message.chat.id,
        message_id: message.message_id,
        text,
        reply_to_message_id,
        reply_to_text,
        sender_id: message.from.map(|u| u.id),
    })
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send(
        &self,
        channel_id: ChannelId,
        message: &RenderedMessage,
        options: SendOptions,
    ) -> Result<Option<MessageRef>, TransportError> {
        let mut payload = json!({
            "chat_id": channel_id,
            "text": message.text,
            "disable_notification": !options.notify,
        });
        if let Some(reply_to) = options.reply_to {
            payload["reply_to_message_id"] = json!(reply_to.message_id);
            payload["allow_sending_without_reply"] = json!(true);
        }
        let result = self.call("sendMessage", payload).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| TransportError::Api("sendMessage returned no message_id".into()))?;
        Ok(Some(MessageRef {
            channel_id,
            message_id,
        }))
    }

    async fn edit(
        &self,
        target: MessageRef,
        message: &RenderedMessage,
    ) -> Result<Option<MessageRef>, TransportError> {
        let payload = json!({
            "chat_id": target.channel_id,
            "message_id": target.message_id,
            "text": message.text,
        });
        match self.call("editMessageText", payload).await {
            Ok(_) => Ok(Some(target)),
            // An identical edit is a no-op, not a failure.
            Err(TransportError::Api(description))
                if description.contains("message is not modified") =>
            {
                Ok(Some(target))
            }
            Err(err) => {
                warn!(error = %err, "telegram.edit_failed");
                Ok(None)
            }
        }
    }

    async fn delete(&self, target: MessageRef) -> Result<bool, TransportError> {
        let payload = json!({
            "chat_id": target.channel_id,
            "message_id": target.message_id,
        });
        match self.call("deleteMessage", payload).await {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!(error = %err, "telegram.delete_failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn poll(
        &self,
        offset: Option<i64>,
        timeout_s: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let mut payload = json!({
            "timeout": timeout_s,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let result = self.call("getUpdates", payload).await?;
        let wire: Vec<WireUpdate> =
            serde_json::from_value(result).map_err(|err| TransportError::Api(err.to_string()))?;
        Ok(wire
            .into_iter()
            .map(|update| Update {
                update_id: update.update_id,
                message: update.message.and_then(incoming_from_wire),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_maps_to_incoming() {
        let raw = json!({
            "update_id": 7,
            "message": {
                "message_id": 100,
                "chat": {"id": 42},
                "text": "hello",
                "from": {"id": 9},
                "reply_to_message": {
                    "message_id": 90,
                    "chat": {"id": 42},
                    "text": "earlier"
                }
            }
        });
        let update: WireUpdate = serde_json::from_value(raw).unwrap();
        let incoming = incoming_from_wire(update.message.unwrap()).unwrap();
        assert_eq!(incoming.chat_id, 42);
        assert_eq!(incoming.text, "hello");
        assert_eq!(incoming.reply_to_message_id, Some(90));
        assert_eq!(incoming.reply_to_text.as_deref(), Some("earlier"));
        assert_eq!(incoming.sender_id, Some(9));
    }

    #[test]
    fn textless_messages_are_dropped() {
        let message: WireMessage = serde_json::from_value(json!({
            "message_id": 1,
            "chat": {"id": 42}
        }))
        .unwrap();
        assert!(incoming_from_wire(message).is_none());
    }
}
