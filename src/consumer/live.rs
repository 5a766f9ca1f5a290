//! Live consumption: hands queued tasks to the notification sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::session::{
    ConsumerSession, HandlingOutcome, MessageHandler, SessionKind, SessionOptions, SessionRuntime,
    SessionState,
};
use super::watchdog::{CompletionSignal, ExpiryReason, WatchdogFactory};
use crate::clock::Clock;
use crate::error::{PollerError, PollerResult};
use crate::messaging::{Delivery, QueueReceiver, QueueTransport};
use crate::models::Task;
use crate::notification::NotificationSink;

pub struct LiveConsumeSession {
    runtime: Arc<SessionRuntime>,
    transport: Arc<dyn QueueTransport>,
    queue_name: String,
    sink: Arc<dyn NotificationSink>,
    deep_link_base_url: String,
    clock: Arc<dyn Clock>,
}

impl LiveConsumeSession {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
        sink: Arc<dyn NotificationSink>,
        deep_link_base_url: impl Into<String>,
        clock: Arc<dyn Clock>,
        deadline: DateTime<Utc>,
        options: SessionOptions,
    ) -> Self {
        Self {
            runtime: SessionRuntime::new(
                SessionKind::LiveConsume,
                Arc::clone(&clock),
                deadline,
                options,
            ),
            transport,
            queue_name: queue_name.into(),
            sink,
            deep_link_base_url: deep_link_base_url.into(),
            clock,
        }
    }
}

#[async_trait]
impl ConsumerSession for LiveConsumeSession {
    fn kind(&self) -> SessionKind {
        SessionKind::LiveConsume
    }

    fn state(&self) -> &SessionState {
        self.runtime.state()
    }

    async fn start(self: Arc<Self>, watchdogs: &WatchdogFactory) -> PollerResult<CompletionSignal> {
        info!(queue = %self.queue_name, "📬 CONSUME: Starting live consumption");

        let receiver = match self.transport.open_receiver(&self.queue_name).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.runtime.shutdown().await;
                return Err(PollerError::session_transport(self.kind(), e.to_string()));
            }
        };

        let handler = Arc::new(TaskDispatcher {
            sink: Arc::clone(&self.sink),
            deep_link_base_url: self.deep_link_base_url.clone(),
            clock: Arc::clone(&self.clock),
        });
        Ok(self.runtime.launch(receiver, handler, watchdogs).await)
    }

    async fn shutdown(&self) -> CompletionSignal {
        self.runtime.shutdown().await
    }

    fn expiry_reason(&self) -> Option<ExpiryReason> {
        self.runtime.expiry_reason()
    }
}

struct TaskDispatcher {
    sink: Arc<dyn NotificationSink>,
    deep_link_base_url: String,
    clock: Arc<dyn Clock>,
}

impl TaskDispatcher {
    async fn acknowledge(&self, receiver: &dyn QueueReceiver, delivery: &Delivery) -> bool {
        match receiver.complete(delivery).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    message_id = %delivery.message.message_id,
                    error = %e,
                    "📬 CONSUME: Failed to acknowledge message"
                );
                false
            }
        }
    }

    async fn give_back(&self, receiver: &dyn QueueReceiver, delivery: &Delivery, err: PollerError) {
        error!(
            message_id = %delivery.message.message_id,
            delivery_count = delivery.delivery_count,
            error = %err,
            "📬 CONSUME: Message handling failed, leaving it for redelivery"
        );
        if let Err(e) = receiver.abandon(delivery).await {
            warn!(
                message_id = %delivery.message.message_id,
                error = %e,
                "📬 CONSUME: Failed to abandon message"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for TaskDispatcher {
    async fn handle(&self, receiver: &dyn QueueReceiver, delivery: Delivery) -> HandlingOutcome {
        let message = &delivery.message;

        if !message.is_task() {
            debug!(
                message_id = %message.message_id,
                label = ?message.label,
                content_type = ?message.content_type,
                "📬 CONSUME: Ignoring message that is not a task"
            );
            self.acknowledge(receiver, &delivery).await;
            return HandlingOutcome::Ignored;
        }

        if message.is_expired(self.clock.now()) {
            info!(
                message_id = %message.message_id,
                expires_at = ?message.expires_at,
                "📬 CONSUME: Dropping expired task"
            );
            self.acknowledge(receiver, &delivery).await;
            return HandlingOutcome::Ignored;
        }

        let task: Task = match message.decode() {
            Ok(task) => task,
            Err(e) => {
                let err = PollerError::message_handling(&message.message_id, e.to_string());
                self.give_back(receiver, &delivery, err).await;
                return HandlingOutcome::Failed;
            }
        };

        info!(task_id = %task.id(), state = %task.state(), "📬 CONSUME: Received task");

        if let Err(e) = self.sink.deliver(&task, &self.deep_link_base_url).await {
            let err = PollerError::message_handling(task.id(), e.to_string());
            self.give_back(receiver, &delivery, err).await;
            return HandlingOutcome::Failed;
        }

        if self.acknowledge(receiver, &delivery).await {
            HandlingOutcome::Processed
        } else {
            HandlingOutcome::Failed
        }
    }
}
