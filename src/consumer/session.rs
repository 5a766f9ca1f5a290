//! # Consumer Sessions
//!
//! A consumer session owns one queue receiver for a bounded time. It pulls batches,
//! hands each delivery to its message handler, records activity, and is shut down by
//! its watchdog when it goes idle or reaches the cycle deadline.
//!
//! [`SessionRuntime`] holds the lifecycle shared by the two variants
//! ([`super::DeadLetterDrainSession`], [`super::LiveConsumeSession`]); the variants only
//! supply the receiver and the handler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::watchdog::{ActivityProbe, CompletionSignal, ExpireAction, ExpiryReason, WatchdogFactory, WatchdogHandle};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::PollerResult;
use crate::logging::log_session_operation;
use crate::messaging::{Delivery, QueueReceiver};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    DeadLetterDrain,
    LiveConsume,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::DeadLetterDrain => "dead_letter_drain",
            SessionKind::LiveConsume => "live_consume",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler did with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingOutcome {
    Processed,
    /// Acknowledged without acting on it
    Ignored,
    /// Left for the transport's redelivery / dead-letter policy
    Failed,
}

impl HandlingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlingOutcome::Processed => "processed",
            HandlingOutcome::Ignored => "ignored",
            HandlingOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub processed: u64,
    pub ignored: u64,
    pub failed: u64,
}

impl SessionStats {
    pub fn handled(&self) -> u64 {
        self.processed + self.ignored + self.failed
    }
}

/// Receive loop tuning shared by both session variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub batch_size: usize,
    /// Pause between receives while the queue is empty
    pub poll_interval: Duration,
    /// How long `shutdown` waits for the message in hand before aborting the loop
    pub shutdown_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl From<&QueueConfig> for SessionOptions {
    fn from(queue: &QueueConfig) -> Self {
        Self {
            batch_size: queue.batch_size,
            poll_interval: queue.poll_interval(),
            shutdown_grace: queue.shutdown_grace(),
        }
    }
}

/// Per-session state the watchdog observes through its probe
#[derive(Debug)]
pub struct SessionState {
    clock: Arc<dyn Clock>,
    last_activity: RwLock<DateTime<Utc>>,
    deadline: DateTime<Utc>,
    processed: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
}

impl SessionState {
    pub fn new(clock: Arc<dyn Clock>, deadline: DateTime<Utc>) -> Self {
        let now = clock.now();
        Self {
            clock,
            last_activity: RwLock::new(now),
            deadline,
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write() = self.clock.now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Count a handled delivery. Every outcome counts as activity.
    pub fn record(&self, outcome: HandlingOutcome) {
        self.touch();
        let counter = match outcome {
            HandlingOutcome::Processed => &self.processed,
            HandlingOutcome::Ignored => &self.ignored,
            HandlingOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
pub trait ConsumerSession: Send + Sync {
    fn kind(&self) -> SessionKind;

    fn state(&self) -> &SessionState;

    /// Open the queue handle, start receiving and arm the watchdog.
    ///
    /// The returned signal resolves once the session has shut down and released its
    /// handle.
    async fn start(self: Arc<Self>, watchdogs: &WatchdogFactory) -> PollerResult<CompletionSignal>;

    /// Stop receiving, close the handle and resolve completion. Idempotent.
    async fn shutdown(&self) -> CompletionSignal;

    /// Why the watchdog ended this session, if it did
    fn expiry_reason(&self) -> Option<ExpiryReason>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, receiver: &dyn QueueReceiver, delivery: Delivery) -> HandlingOutcome;
}

/// Receive loop, handle ownership and shutdown shared by every session variant
pub struct SessionRuntime {
    kind: SessionKind,
    state: Arc<SessionState>,
    options: SessionOptions,
    stop: CancellationToken,
    receiver: Mutex<Option<Arc<dyn QueueReceiver>>>,
    loop_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<WatchdogHandle>>,
    closed: OnceCell<()>,
    completion: CompletionSignal,
}

impl SessionRuntime {
    pub fn new(
        kind: SessionKind,
        clock: Arc<dyn Clock>,
        deadline: DateTime<Utc>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Arc::new(SessionState::new(clock, deadline)),
            options: SessionOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            stop: CancellationToken::new(),
            receiver: Mutex::new(None),
            loop_task: tokio::sync::Mutex::new(None),
            watchdog: Mutex::new(None),
            closed: OnceCell::new(),
            completion: CompletionSignal::new(),
        })
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    pub fn expiry_reason(&self) -> Option<ExpiryReason> {
        self.watchdog.lock().as_ref().and_then(WatchdogHandle::reason)
    }

    /// Take ownership of `receiver`, start the receive loop and arm the watchdog
    pub async fn launch(
        self: &Arc<Self>,
        receiver: Arc<dyn QueueReceiver>,
        handler: Arc<dyn MessageHandler>,
        watchdogs: &WatchdogFactory,
    ) -> CompletionSignal {
        if self.closed.initialized() {
            if let Err(e) = receiver.close().await {
                warn!(session = %self.kind, error = %e, "Failed to close receiver of a stopped session");
            }
            return self.completion();
        }

        self.state.touch();
        *self.receiver.lock() = Some(Arc::clone(&receiver));
        let task = self.spawn_receive_loop(receiver, handler);
        *self.loop_task.lock().await = Some(task);

        let weak = Arc::downgrade(self);
        let on_expire: ExpireAction = Box::new(move || {
            async move {
                if let Some(runtime) = weak.upgrade() {
                    runtime.shutdown().await;
                }
            }
            .boxed()
        });
        let state = Arc::clone(&self.state);
        let probe: ActivityProbe = Arc::new(move || state.last_activity());
        let watchdog = watchdogs.supervise(self.kind.as_str(), probe, self.state.deadline(), on_expire);
        *self.watchdog.lock() = Some(watchdog);

        log_session_operation("start", self.kind.as_str(), "receiving", None, None);
        self.completion()
    }

    fn spawn_receive_loop(
        &self,
        receiver: Arc<dyn QueueReceiver>,
        handler: Arc<dyn MessageHandler>,
    ) -> JoinHandle<()> {
        let kind = self.kind;
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let batch_size = self.options.batch_size;
        let poll_interval = self.options.poll_interval;

        tokio::spawn(async move {
            debug!(session = %kind, queue = %receiver.queue_name(), "Receive loop started");
            loop {
                let received = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    received = receiver.receive(batch_size) => received,
                };

                match received {
                    Ok(deliveries) if deliveries.is_empty() => {
                        if pause(&stop, poll_interval).await {
                            break;
                        }
                    }
                    Ok(deliveries) => {
                        // Deliveries already taken off the queue are finished before the
                        // stop signal is observed again.
                        for delivery in deliveries {
                            let outcome = handler.handle(receiver.as_ref(), delivery).await;
                            state.record(outcome);
                            metrics::session_messages_total().add(
                                1,
                                &[
                                    KeyValue::new("session", kind.as_str()),
                                    KeyValue::new("result", outcome.as_str()),
                                ],
                            );
                        }
                    }
                    Err(e) => {
                        warn!(session = %kind, error = %e, "Receive failed, backing off");
                        if pause(&stop, poll_interval).await {
                            break;
                        }
                    }
                }
            }
            debug!(session = %kind, "Receive loop stopped");
        })
    }

    pub async fn shutdown(&self) -> CompletionSignal {
        self.closed
            .get_or_init(|| async {
                self.stop.cancel();
                if let Some(watchdog) = self.watchdog.lock().as_ref() {
                    watchdog.disarm();
                }

                let loop_task = self.loop_task.lock().await.take();
                if let Some(mut task) = loop_task {
                    match tokio::time::timeout(self.options.shutdown_grace, &mut task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(session = %self.kind, error = %e, "Receive loop ended abnormally");
                        }
                        Err(_) => {
                            // The message in hand stays unacknowledged and is redelivered.
                            warn!(
                                session = %self.kind,
                                grace_seconds = self.options.shutdown_grace.as_secs(),
                                "Handler still busy after the shutdown grace period, aborting receive loop"
                            );
                            task.abort();
                            let _ = task.await;
                        }
                    }
                }

                let receiver = self.receiver.lock().take();
                if let Some(receiver) = receiver {
                    if let Err(e) = receiver.close().await {
                        warn!(session = %self.kind, error = %e, "Failed to close receiver");
                    }
                }

                let stats = self.state.stats();
                log_session_operation(
                    "shutdown",
                    self.kind.as_str(),
                    "closed",
                    Some(stats.processed),
                    Some(stats.failed),
                );
                self.completion.resolve();
            })
            .await;

        self.completion()
    }
}

/// Sleep unless stopped first. Returns whether the stop signal fired.
async fn pause(stop: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}
