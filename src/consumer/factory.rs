use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::dead_letter::DeadLetterDrainSession;
use super::live::LiveConsumeSession;
use super::session::{ConsumerSession, SessionOptions};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::messaging::QueueTransport;
use crate::notification::NotificationSink;

/// Builds the two sessions of a cycle, both bounded by the cycle deadline
pub trait SessionFactory: Send + Sync {
    fn dead_letter_drain(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession>;

    fn live_consume(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession>;
}

pub struct QueueSessionFactory {
    transport: Arc<dyn QueueTransport>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    queue: QueueConfig,
    deep_link_base_url: String,
}

impl QueueSessionFactory {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        queue: QueueConfig,
        deep_link_base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            sink,
            clock,
            queue,
            deep_link_base_url: deep_link_base_url.into(),
        }
    }
}

impl SessionFactory for QueueSessionFactory {
    fn dead_letter_drain(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession> {
        Arc::new(DeadLetterDrainSession::new(
            Arc::clone(&self.transport),
            self.queue.name.clone(),
            Arc::clone(&self.clock),
            deadline,
            SessionOptions::from(&self.queue),
        ))
    }

    fn live_consume(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession> {
        Arc::new(LiveConsumeSession::new(
            Arc::clone(&self.transport),
            self.queue.name.clone(),
            Arc::clone(&self.sink),
            self.deep_link_base_url.clone(),
            Arc::clone(&self.clock),
            deadline,
            SessionOptions::from(&self.queue),
        ))
    }
}
