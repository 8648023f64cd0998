//! Inbound Message Source
//!
//! The messaging session layer runs outside the relay and publishes every new
//! message as JSON on a Redis pub/sub channel. This module defines that wire
//! format, the chat identity carried with it, the source allow-list, and a
//! subscriber that reconnects with exponential backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_source, DEFAULT_INBOUND_CHANNEL, DEFAULT_REDIS_URL};

/// Maximum number of reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Errors that can occur on the inbound side
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed inbound message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Chat resolution failed: {0}")]
    ChatResolution(String),

    #[error("Message carries no chat identity")]
    MissingChat,

    #[error("Max reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

/// Who a message came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatIdentity {
    /// A private chat with a user
    User {
        id: i64,
        #[serde(default)]
        username: Option<String>,
    },
    /// A group or broadcast channel
    Channel {
        id: i64,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
}

impl ChatIdentity {
    pub fn id(&self) -> i64 {
        match self {
            ChatIdentity::User { id, .. } | ChatIdentity::Channel { id, .. } => *id,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            ChatIdentity::User { username, .. } | ChatIdentity::Channel { username, .. } => {
                username.as_deref().filter(|u| !u.is_empty())
            }
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            ChatIdentity::User { .. } => None,
            ChatIdentity::Channel { title, .. } => title.as_deref().filter(|t| !t.is_empty()),
        }
    }

    /// The username when there is one, otherwise the numeric id
    pub fn username_or_id(&self) -> String {
        self.username()
            .map(str::to_string)
            .unwrap_or_else(|| self.id().to_string())
    }

    /// Name recorded in the transaction log: title, then username, then id
    pub fn display_name(&self) -> String {
        self.title()
            .map(str::to_string)
            .unwrap_or_else(|| self.username_or_id())
    }
}

/// A new message as delivered by the session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// When the platform dated the message
    pub date: DateTime<Utc>,
    /// Raw message text
    pub text: String,
    #[serde(default)]
    pub chat: Option<ChatIdentity>,
    /// Set by the session layer when it could not resolve the chat
    #[serde(default)]
    pub chat_error: Option<String>,
}

impl InboundMessage {
    pub fn new(date: DateTime<Utc>, text: impl Into<String>, chat: ChatIdentity) -> Self {
        Self {
            date,
            text: text.into(),
            chat: Some(chat),
            chat_error: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The chat this message came from, or why it is unknown
    pub fn resolve_chat(&self) -> Result<&ChatIdentity, SourceError> {
        if let Some(reason) = &self.chat_error {
            return Err(SourceError::ChatResolution(reason.clone()));
        }
        self.chat.as_ref().ok_or(SourceError::MissingChat)
    }
}

/// Allow-list of source usernames and chat ids
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    entries: HashSet<String>,
}

impl SourceList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|s| normalize_source(s.as_ref().trim()).to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// True when the chat's username or id is listed
    pub fn matches(&self, chat: &ChatIdentity) -> bool {
        if let Some(username) = chat.username() {
            if self.entries.contains(normalize_source(username)) {
                return true;
            }
        }
        self.entries.contains(&chat.id().to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Anything that can feed inbound messages to the pipeline
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver messages to `tx` until the source ends or `tx` is closed
    async fn run(&self, tx: mpsc::Sender<InboundMessage>) -> Result<(), SourceError>;
}

/// Configuration for the Redis subscriber
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub redis_url: String,
    pub channel: String,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            channel: DEFAULT_INBOUND_CHANNEL.to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl SourceConfig {
    pub fn new(redis_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms * 2u64.pow(attempt.min(10));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// How a subscription ended
enum StreamEnd {
    /// The pipeline hung up
    ReceiverClosed,
    /// The Redis connection dropped
    Disconnected,
}

/// Redis pub/sub subscriber for inbound messages
pub struct RedisSource {
    config: SourceConfig,
}

impl RedisSource {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    async fn subscribe_and_stream(
        &self,
        tx: &mpsc::Sender<InboundMessage>,
        attempts: &mut u32,
    ) -> Result<StreamEnd, SourceError> {
        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.channel).await?;

        info!("Subscribed to inbound channel {}", self.config.channel);
        *attempts = 0;

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping non-text payload: {}", e);
                    continue;
                }
            };

            match InboundMessage::from_json(&payload) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        return Ok(StreamEnd::ReceiverClosed);
                    }
                }
                Err(e) => warn!("Dropping inbound payload: {}", e),
            }
        }

        Ok(StreamEnd::Disconnected)
    }
}

#[async_trait]
impl MessageSource for RedisSource {
    fn name(&self) -> &str {
        "redis"
    }

    async fn run(&self, tx: mpsc::Sender<InboundMessage>) -> Result<(), SourceError> {
        let mut attempts = 0u32;

        loop {
            match self.subscribe_and_stream(&tx, &mut attempts).await {
                Ok(StreamEnd::ReceiverClosed) => {
                    debug!("Pipeline closed, stopping {} source", self.name());
                    return Ok(());
                }
                Ok(StreamEnd::Disconnected) => warn!("Inbound subscription dropped"),
                Err(e) => error!("Inbound subscription failed: {}", e),
            }

            if attempts >= self.config.max_reconnect_attempts {
                return Err(SourceError::MaxReconnectAttemptsExceeded(
                    self.config.max_reconnect_attempts,
                ));
            }

            let delay = self.config.backoff_delay(attempts);
            warn!(
                "Attempting to reconnect (attempt {}/{}), waiting {:?}",
                attempts + 1,
                self.config.max_reconnect_attempts,
                delay
            );
            sleep(delay).await;
            attempts += 1;
        }
    }
}
