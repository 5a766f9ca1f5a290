//! # Queue Transport Abstraction
//!
//! The seam between the consumer sessions and whatever queue backs them. Production
//! uses [`super::PgmqTransport`]; tests use [`super::InMemoryTransport`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::errors::MessagingResult;
use super::message::{Delivery, QueueMessage};

#[async_trait]
pub trait QueueTransport: Send + Sync + fmt::Debug {
    /// Place one envelope on `queue`, returning the transport's id for it
    async fn send(&self, queue: &str, message: &QueueMessage) -> MessagingResult<i64>;

    /// Place envelopes on `queue` in order, stopping at the first failure
    async fn publish(&self, queue: &str, messages: &[QueueMessage]) -> MessagingResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.send(queue, message).await?);
        }
        Ok(ids)
    }

    async fn open_receiver(&self, queue: &str) -> MessagingResult<Arc<dyn QueueReceiver>>;

    /// Receiver over the dead-letter queue paired with `queue`
    async fn open_dead_letter_receiver(&self, queue: &str) -> MessagingResult<Arc<dyn QueueReceiver>>;
}

#[async_trait]
pub trait QueueReceiver: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Up to `max` currently visible messages; empty when the queue is idle
    async fn receive(&self, max: usize) -> MessagingResult<Vec<Delivery>>;

    /// Acknowledge and remove
    async fn complete(&self, delivery: &Delivery) -> MessagingResult<()>;

    /// Give the message back to the transport's redelivery / dead-letter policy
    async fn abandon(&self, delivery: &Delivery) -> MessagingResult<()>;

    /// Release the handle. Further calls to `receive` fail.
    async fn close(&self) -> MessagingResult<()>;
}
