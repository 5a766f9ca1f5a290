//! Dead-letter drain: moves parked messages back onto the live queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::session::{
    ConsumerSession, HandlingOutcome, MessageHandler, SessionKind, SessionOptions, SessionRuntime,
    SessionState,
};
use super::watchdog::{CompletionSignal, ExpiryReason, WatchdogFactory};
use crate::clock::Clock;
use crate::error::{PollerError, PollerResult};
use crate::messaging::{Delivery, QueueReceiver, QueueTransport};

pub struct DeadLetterDrainSession {
    runtime: Arc<SessionRuntime>,
    transport: Arc<dyn QueueTransport>,
    queue_name: String,
}

impl DeadLetterDrainSession {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
        clock: Arc<dyn Clock>,
        deadline: DateTime<Utc>,
        options: SessionOptions,
    ) -> Self {
        Self {
            runtime: SessionRuntime::new(
                SessionKind::DeadLetterDrain,
                clock,
                deadline,
                options,
            ),
            transport,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl ConsumerSession for DeadLetterDrainSession {
    fn kind(&self) -> SessionKind {
        SessionKind::DeadLetterDrain
    }

    fn state(&self) -> &SessionState {
        self.runtime.state()
    }

    async fn start(self: Arc<Self>, watchdogs: &WatchdogFactory) -> PollerResult<CompletionSignal> {
        info!(queue = %self.queue_name, "🧹 DRAIN: Collecting dead letters");

        let receiver = match self.transport.open_dead_letter_receiver(&self.queue_name).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.runtime.shutdown().await;
                return Err(PollerError::session_transport(self.kind(), e.to_string()));
            }
        };

        let handler = Arc::new(Republisher {
            transport: Arc::clone(&self.transport),
            live_queue: self.queue_name.clone(),
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

struct Republisher {
    transport: Arc<dyn QueueTransport>,
    live_queue: String,
}

#[async_trait]
impl MessageHandler for Republisher {
    async fn handle(&self, receiver: &dyn QueueReceiver, delivery: Delivery) -> HandlingOutcome {
        let message_id = delivery.message.message_id.clone();

        if let Err(e) = self.transport.send(&self.live_queue, &delivery.message).await {
            // Stays parked for the next drain.
            error!(
                message_id = %message_id,
                error = %e,
                "🧹 DRAIN: Failed to republish dead letter"
            );
            return HandlingOutcome::Failed;
        }

        match receiver.complete(&delivery).await {
            Ok(()) => {
                debug!(message_id = %message_id, queue = %self.live_queue, "🧹 DRAIN: Dead letter republished");
                HandlingOutcome::Processed
            }
            Err(e) => {
                error!(
                    message_id = %message_id,
                    error = %e,
                    "🧹 DRAIN: Republished but could not remove dead letter"
                );
                HandlingOutcome::Failed
            }
        }
    }
}
