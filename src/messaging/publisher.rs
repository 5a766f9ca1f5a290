//! Task publisher: wraps tasks in labelled envelopes and places them on the live queue.

use std::sync::Arc;
use tracing::{debug, info};

use super::errors::MessagingResult;
use super::message::QueueMessage;
use super::transport::QueueTransport;
use crate::clock::Clock;
use crate::metrics;
use crate::models::Task;

#[derive(Debug, Clone)]
pub struct TaskPublisher {
    transport: Arc<dyn QueueTransport>,
    queue_name: String,
    message_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TaskPublisher {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
        message_ttl: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            queue_name: queue_name.into(),
            message_ttl,
            clock,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Publish `tasks` in order. Fails on the first envelope the transport refuses.
    pub async fn publish(&self, tasks: &[Task]) -> MessagingResult<usize> {
        if tasks.is_empty() {
            debug!(queue = %self.queue_name, "📤 PUBLISHER: Nothing to publish");
            return Ok(0);
        }

        let now = self.clock.now();
        let envelopes = tasks
            .iter()
            .map(|task| QueueMessage::for_task(task, now, self.message_ttl))
            .collect::<MessagingResult<Vec<_>>>()?;

        let ids = self.transport.publish(&self.queue_name, &envelopes).await?;
        metrics::tasks_published_total().add(ids.len() as u64, &[]);

        info!(
            queue = %self.queue_name,
            count = ids.len(),
            "✅ PUBLISHER: Items placed on the queue successfully"
        );
        Ok(ids.len())
    }
}
