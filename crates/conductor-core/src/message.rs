use crate::types::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The kind of an inter-agent [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Ask the recipient to do something.
    Command,
    /// Hand over data.
    Data,
    /// Inform, no reply expected.
    Notification,
    /// Reply to an earlier message, see [`Message::correlation_id`].
    Response,
}

/// Delivery status of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Queued for the recipient.
    Sent,
    /// Handed to the recipient by a poll.
    Delivered,
    /// Acknowledged by the recipient.
    Processed,
    /// Could not be delivered.
    Failed,
}

/// A message routed between agents by the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Name of the sending agent.
    pub sender: String,
    /// Name of the receiving agent.
    pub recipient: String,
    pub message_type: MessageType,
    pub subject: String,
    /// Structured payload.
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub status: MessageStatus,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Past this instant the message is never delivered.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the sender expects a [`MessageType::Response`].
    #[serde(default)]
    pub response_required: bool,
    /// How long the sender waits for the response.
    pub response_timeout: Option<Duration>,
    /// Id of the message this one answers.
    pub correlation_id: Option<Uuid>,
}

impl Message {
    /// Creates a new message in the `Sent` state with normal priority.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageType,
        subject: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            subject: subject.into(),
            content,
            priority: Priority::Normal,
            status: MessageStatus::Sent,
            sent_at: Utc::now(),
            delivered_at: None,
            processed_at: None,
            expires_at: None,
            response_required: false,
            response_timeout: None,
            correlation_id: None,
        }
    }

    /// Creates a [`MessageType::Command`] message.
    pub fn command(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self::new(sender, recipient, MessageType::Command, subject, content)
    }

    /// Creates a [`MessageType::Data`] message.
    pub fn data(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self::new(sender, recipient, MessageType::Data, subject, content)
    }

    /// Creates a [`MessageType::Notification`] message.
    pub fn notification(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self::new(sender, recipient, MessageType::Notification, subject, content)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets an absolute expiry instant.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Sets the expiry relative to now.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }

    /// Requires a response within `timeout`.
    pub fn require_response(mut self, timeout: Duration) -> Self {
        self.response_required = true;
        self.response_timeout = Some(timeout);
        self
    }

    /// Builds the response to this message, addressed back to its sender.
    pub fn reply(&self, content: serde_json::Value) -> Message {
        let mut response = Message::new(
            self.recipient.clone(),
            self.sender.clone(),
            MessageType::Response,
            format!("re: {}", self.subject),
            content,
        )
        .with_priority(self.priority);
        response.correlation_id = Some(self.id);
        response
    }

    /// Whether the message is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
