//! Outbound Forwarding
//!
//! Sends qualifying identifiers to the configured destination. The session
//! layer consumes `OutboundMessage` JSON from a Redis pub/sub channel and
//! performs the actual platform send.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DEFAULT_OUTBOUND_CHANNEL;

/// Errors that can occur while forwarding
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Destination is empty")]
    EmptyDestination,
}

/// A `send(destination, text)` request for the session layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    /// Username or chat id to send to
    pub destination: String,
    /// Message body
    pub text: String,
    /// Unix timestamp in milliseconds when the request was made
    pub timestamp: u64,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            text: text.into(),
            timestamp: current_timestamp_millis(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The outbound `send` primitive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ForwardError>;
}

/// Redis publisher for outbound messages
pub struct RedisForwarder {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisForwarder {
    /// Create a new forwarder with a Redis connection
    ///
    /// # Arguments
    /// * `connection` - An established Redis multiplexed connection
    /// * `channel` - The pub/sub channel the session layer listens on
    pub fn new(connection: MultiplexedConnection, channel: impl Into<String>) -> Self {
        Self {
            connection,
            channel: channel.into(),
        }
    }

    /// Connect to `redis_url` and publish on `channel`
    pub async fn connect(
        redis_url: &str,
        channel: impl Into<String>,
    ) -> Result<Self, ForwardError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection, channel))
    }

    /// Create a new forwarder with the default channel
    pub fn with_default_channel(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_OUTBOUND_CHANNEL)
    }

    /// Publish a pre-formatted message
    ///
    /// # Returns
    /// The number of subscribers that received the message
    pub async fn publish_message(&self, message: &OutboundMessage) -> Result<i64, ForwardError> {
        let json = message.to_json()?;
        let mut connection = self.connection.clone();
        let subscribers: i64 = connection.publish(&self.channel, &json).await?;
        Ok(subscribers)
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Forwarder for RedisForwarder {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ForwardError> {
        if destination.is_empty() {
            return Err(ForwardError::EmptyDestination);
        }

        let message = OutboundMessage::new(destination, text);
        let subscribers = self.publish_message(&message).await?;
        if subscribers == 0 {
            warn!("No session layer subscribed to {}; message may be lost", self.channel);
        } else {
            debug!("Forward delivered to {} subscriber(s)", subscribers);
        }
        Ok(())
    }
}
