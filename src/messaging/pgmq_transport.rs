//! # PostgreSQL Message Queue Transport (pgmq-rs)
//!
//! Queue transport backed by pgmq. Each logical queue `q` has a companion dead-letter
//! queue `q_dlq`. Reads use a visibility timeout, so a message that is neither deleted
//! nor moved reappears once the timeout lapses. `abandon` parks a message on the
//! dead-letter queue after `max_delivery_count` deliveries.

use async_trait::async_trait;
use pgmq::{types::Message, PGMQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::errors::{MessagingError, MessagingResult};
use super::message::{Delivery, QueueMessage};
use super::transport::{QueueReceiver, QueueTransport};
use crate::config::QueueConfig;
use crate::constants::dead_letter_queue_name;

#[derive(Debug, Clone)]
pub struct PgmqTransport {
    pgmq: PGMQueue,
    visibility_timeout_seconds: i32,
    max_delivery_count: i32,
}

impl PgmqTransport {
    /// Connect using a connection string
    pub async fn connect(database_url: &str, config: &QueueConfig) -> MessagingResult<Self> {
        info!("🚀 Connecting to pgmq using pgmq-rs crate");

        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| MessagingError::database_connection(e.to_string()))?;

        info!("✅ Connected to pgmq using pgmq-rs");
        Ok(Self {
            pgmq,
            visibility_timeout_seconds: config.visibility_timeout_seconds,
            max_delivery_count: config.max_delivery_count,
        })
    }

    /// Create `queue` and its dead-letter queue if they do not exist
    pub async fn ensure_queues(&self, queue: &str) -> MessagingResult<()> {
        for name in [queue.to_string(), dead_letter_queue_name(queue)] {
            debug!("📋 Creating queue: {}", name);
            self.pgmq
                .create(&name)
                .await
                .map_err(|e| MessagingError::queue_operation(&name, "create", e.to_string()))?;
        }
        info!(queue = %queue, "✅ Queues ready");
        Ok(())
    }

    fn receiver(&self, queue: String, dead_letter_queue: Option<String>) -> Arc<dyn QueueReceiver> {
        Arc::new(PgmqReceiver {
            pgmq: self.pgmq.clone(),
            queue,
            dead_letter_queue,
            visibility_timeout_seconds: self.visibility_timeout_seconds,
            max_delivery_count: self.max_delivery_count,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl QueueTransport for PgmqTransport {
    async fn send(&self, queue: &str, message: &QueueMessage) -> MessagingResult<i64> {
        debug!(
            "📤 Sending message to queue: {} for message: {}",
            queue, message.message_id
        );

        let msg_id = self
            .pgmq
            .send(queue, message)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "send", e.to_string()))?;

        debug!("✅ Message sent to queue: {} with id: {}", queue, msg_id);
        Ok(msg_id)
    }

    async fn open_receiver(&self, queue: &str) -> MessagingResult<Arc<dyn QueueReceiver>> {
        Ok(self.receiver(queue.to_string(), Some(dead_letter_queue_name(queue))))
    }

    async fn open_dead_letter_receiver(
        &self,
        queue: &str,
    ) -> MessagingResult<Arc<dyn QueueReceiver>> {
        // Dead letters are never parked a second time.
        Ok(self.receiver(dead_letter_queue_name(queue), None))
    }
}

struct PgmqReceiver {
    pgmq: PGMQueue,
    queue: String,
    dead_letter_queue: Option<String>,
    visibility_timeout_seconds: i32,
    max_delivery_count: i32,
    closed: AtomicBool,
}

impl PgmqReceiver {
    fn ensure_open(&self) -> MessagingResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::receiver_closed(&self.queue));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueReceiver for PgmqReceiver {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, max: usize) -> MessagingResult<Vec<Delivery>> {
        self.ensure_open()?;

        let limit = i32::try_from(max).unwrap_or(i32::MAX);
        let messages: Vec<Message<serde_json::Value>> = self
            .pgmq
            .read_batch(&self.queue, Some(self.visibility_timeout_seconds), limit)
            .await
            .map_err(|e| MessagingError::queue_operation(&self.queue, "read_batch", e.to_string()))?
            .unwrap_or_default();

        if !messages.is_empty() {
            debug!(
                "📨 Read {} messages from queue: {}",
                messages.len(),
                self.queue
            );
        }

        Ok(messages
            .into_iter()
            .map(|msg| Delivery {
                delivery_id: msg.msg_id,
                delivery_count: msg.read_ct,
                message: QueueMessage::from_payload(msg.msg_id.to_string(), msg.message, msg.enqueued_at),
            })
            .collect())
    }

    async fn complete(&self, delivery: &Delivery) -> MessagingResult<()> {
        self.pgmq
            .delete(&self.queue, delivery.delivery_id)
            .await
            .map_err(|e| MessagingError::queue_operation(&self.queue, "delete", e.to_string()))?;
        debug!("🗑️ Message {} deleted from queue: {}", delivery.delivery_id, self.queue);
        Ok(())
    }

    async fn abandon(&self, delivery: &Delivery) -> MessagingResult<()> {
        let Some(dead_letter_queue) = &self.dead_letter_queue else {
            return Ok(());
        };
        if delivery.delivery_count < self.max_delivery_count {
            // Becomes visible again once the visibility timeout lapses.
            return Ok(());
        }

        warn!(
            message_id = %delivery.message.message_id,
            delivery_count = delivery.delivery_count,
            dead_letter_queue = %dead_letter_queue,
            "📦 Parking message on dead-letter queue"
        );
        self.pgmq
            .send(dead_letter_queue, &delivery.message)
            .await
            .map_err(|e| MessagingError::queue_operation(dead_letter_queue, "send", e.to_string()))?;
        self.complete(delivery).await
    }

    async fn close(&self) -> MessagingResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
