//! # Queue Envelopes
//!
//! Every message the poller places on a queue is wrapped in a [`QueueMessage`] that
//! carries a label and content type next to the JSON body. Consumers check both before
//! touching the body, so foreign messages on the same queue are acknowledged and ignored.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::{MessagingError, MessagingResult};
use crate::constants::{JSON_CONTENT_TYPE, TASK_LABEL};
use crate::models::Task;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub body: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// Envelope for a task, expiring `ttl` after `now`
    pub fn for_task(task: &Task, now: DateTime<Utc>, ttl: chrono::Duration) -> MessagingResult<Self> {
        let body = serde_json::to_value(task)
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        Ok(Self {
            message_id: task.id().to_string(),
            label: Some(TASK_LABEL.to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body,
            enqueued_at: now,
            expires_at: Some(now + ttl),
        })
    }

    /// Wrap a payload that did not arrive as an envelope.
    ///
    /// The result carries no label, so the live consumer acknowledges and skips it.
    pub fn unlabelled(message_id: impl Into<String>, body: serde_json::Value, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            label: None,
            content_type: None,
            body,
            enqueued_at,
            expires_at: None,
        }
    }

    /// Interpret a raw queue payload, falling back to [`QueueMessage::unlabelled`]
    pub fn from_payload(message_id: impl Into<String>, payload: serde_json::Value, enqueued_at: DateTime<Utc>) -> Self {
        match serde_json::from_value::<QueueMessage>(payload.clone()) {
            Ok(envelope) => envelope,
            Err(_) => Self::unlabelled(message_id, payload, enqueued_at),
        }
    }

    pub fn is_task(&self) -> bool {
        self.label.as_deref() == Some(TASK_LABEL)
            && self.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

/// An envelope as handed out by a receiver
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-assigned id used to acknowledge or abandon this delivery
    pub delivery_id: i64,
    /// How many times the transport has handed this message out, including this time
    pub delivery_count: i32,
    pub message: QueueMessage,
}
