//! Telegram Bot API transport.
//!
//! Thin reqwest client implementing the `ChatTransport` contract plus the
//! long-poll update loop. Sends try Markdown first and fall back to plain
//! text when the platform rejects the markup — a rendering failure never
//! drops a message. Transient HTTP failures get a small bounded retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ccbot_protocol::{ChatTransport, TransportError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT_SECS: u64 = 50;
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// One inbound event the command router consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    Message {
        user_id: i64,
        chat_id: i64,
        topic_id: Option<i64>,
        text: String,
    },
    TopicClosed {
        user_id: i64,
        chat_id: i64,
        topic_id: i64,
    },
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Incoming>,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    #[allow(dead_code)]
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    message_thread_id: Option<i64>,
    text: Option<String>,
    forum_topic_closed: Option<Value>,
    forum_topic_deleted: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Classify an incoming platform message. Everything outside a forum topic
/// is dropped here — the bridge only operates in topic mode.
fn classify_update(incoming: Incoming) -> Option<ChatUpdate> {
    let user_id = incoming.from?.id;
    let chat_id = incoming.chat.id;

    if incoming.forum_topic_closed.is_some() || incoming.forum_topic_deleted.is_some() {
        return Some(ChatUpdate::TopicClosed {
            user_id,
            chat_id,
            topic_id: incoming.message_thread_id?,
        });
    }

    let text = incoming.text?;
    Some(ChatUpdate::Message {
        user_id,
        chat_id,
        topic_id: incoming.message_thread_id,
        text,
    })
}

/// The platform flags markup it cannot render with a parse-entity error;
/// those sends are retried as plain text.
fn is_markup_rejection(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("can't parse entities") || lower.contains("parse")
}

fn is_message_gone(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("message to edit not found")
        || lower.contains("message to delete not found")
        || lower.contains("message can't be edited")
}

fn is_not_modified(description: &str) -> bool {
    description.to_lowercase().contains("message is not modified")
}

pub struct TelegramTransport {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 10))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{API_BASE}/bot{bot_token}"),
        })
    }

    /// POST one Bot API method with bounded retry on transport failures and
    /// 429 backoff. API-level errors (`ok: false`) surface immediately.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
    ) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.base_url, method);
        let mut last_error = None;

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * attempt as u32).await;
            }

            let response = match self.http.post(&url).json(payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(
                        component = "telegram",
                        event = "telegram.request_failed",
                        method = %method,
                        attempt = attempt,
                        error = %e,
                        "HTTP request failed"
                    );
                    last_error = Some(TransportError::Http(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            let body: ApiResponse<T> = match response.json().await {
                Ok(b) => b,
                Err(e) => {
                    last_error = Some(TransportError::Http(e.to_string()));
                    continue;
                }
            };

            if body.ok {
                if let Some(result) = body.result {
                    return Ok(result);
                }
                return Err(TransportError::Api("missing result".to_string()));
            }

            let description = body
                .description
                .unwrap_or_else(|| format!("HTTP {status}"));

            // Flood control: honor retry_after once, then keep trying.
            if let Some(retry_after) = body.parameters.and_then(|p| p.retry_after) {
                warn!(
                    component = "telegram",
                    event = "telegram.flood_control",
                    method = %method,
                    retry_after_secs = retry_after,
                    "Rate limited by platform"
                );
                tokio::time::sleep(Duration::from_secs(retry_after.min(30))).await;
                last_error = Some(TransportError::Api(description));
                continue;
            }

            if status.is_server_error() {
                last_error = Some(TransportError::Http(description));
                continue;
            }

            return Err(TransportError::Api(description));
        }

        Err(last_error.unwrap_or_else(|| TransportError::Http("retries exhausted".to_string())))
    }

    async fn send_with_fallback(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<SentMessage, TransportError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(topic) = topic_id {
            payload["message_thread_id"] = json!(topic);
        }

        match self.call::<SentMessage>("sendMessage", &payload).await {
            Ok(sent) => Ok(sent),
            Err(TransportError::Api(desc)) if is_markup_rejection(&desc) => {
                payload.as_object_mut().expect("payload object").remove("parse_mode");
                self.call::<SentMessage>("sendMessage", &payload).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<i64, TransportError> {
        let sent = self.send_with_fallback(chat_id, topic_id, text).await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        let result = self.call::<Value>("editMessageText", &payload).await;
        match result {
            Ok(_) => Ok(()),
            Err(TransportError::Api(desc)) if is_markup_rejection(&desc) => {
                payload.as_object_mut().expect("payload object").remove("parse_mode");
                self.call::<Value>("editMessageText", &payload).await.map(|_| ())
            }
            Err(TransportError::Api(desc)) if is_not_modified(&desc) => Ok(()),
            Err(TransportError::Api(desc)) if is_message_gone(&desc) => {
                Err(TransportError::MessageGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        let payload = json!({"chat_id": chat_id, "message_id": message_id});
        match self.call::<Value>("deleteMessage", &payload).await {
            Ok(_) => Ok(()),
            Err(TransportError::Api(desc)) if is_message_gone(&desc) => {
                Err(TransportError::MessageGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_typing(&self, chat_id: i64, topic_id: Option<i64>) -> Result<(), TransportError> {
        let mut payload = json!({"chat_id": chat_id, "action": "typing"});
        if let Some(topic) = topic_id {
            payload["message_thread_id"] = json!(topic);
        }
        self.call::<Value>("sendChatAction", &payload).await.map(|_| ())
    }
}

/// Long-poll `getUpdates` and feed classified updates to the router until
/// shutdown. Poll errors back off and retry; the loop never dies on its own.
pub async fn run_update_loop(
    transport: Arc<TelegramTransport>,
    tx: mpsc::Sender<ChatUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        component = "telegram",
        event = "telegram.update_loop_started",
        "Update loop started"
    );
    let mut offset: i64 = 0;

    loop {
        let payload = json!({
            "offset": offset,
            "timeout": LONG_POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });

        let updates = tokio::select! {
            result = transport.call::<Vec<Update>>("getUpdates", &payload) => result,
            _ = shutdown.changed() => break,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(incoming) = update.message else {
                        continue;
                    };
                    if let Some(classified) = classify_update(incoming) {
                        if tx.send(classified).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    component = "telegram",
                    event = "telegram.get_updates_failed",
                    error = %e,
                    "getUpdates failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!(
        component = "telegram",
        event = "telegram.update_loop_stopped",
        "Update loop stopped"
    );
}
