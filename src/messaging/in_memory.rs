//! # In-Memory Queue Transport
//!
//! Process-local transport with the same delivery semantics as the pgmq transport:
//! received messages are hidden until completed or abandoned, abandoned messages are
//! parked on `{queue}_dlq` once they reach the delivery limit, and closing a receiver
//! releases whatever it still holds. Used by the test suite; dry runs still publish
//! through pgmq and only skip the case store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::errors::{MessagingError, MessagingResult};
use super::message::{Delivery, QueueMessage};
use super::transport::{QueueReceiver, QueueTransport};
use crate::constants::dead_letter_queue_name;

const DEFAULT_MAX_DELIVERY_COUNT: i32 = 10;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    message: QueueMessage,
    read_count: i32,
    claimed_by: Option<u64>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    sent: Vec<QueueMessage>,
}

#[derive(Debug)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    failing_sends: Mutex<HashSet<String>>,
    fail_open: AtomicBool,
    next_message_id: AtomicU64,
    next_receiver_id: AtomicU64,
    open_receivers: AtomicUsize,
    max_delivery_count: i32,
}

impl Inner {
    fn push(&self, queue: &str, message: QueueMessage) -> i64 {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.sent.push(message.clone());
        state.messages.push_back(StoredMessage {
            id,
            message,
            read_count: 0,
            claimed_by: None,
        });
        id
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_max_delivery_count(DEFAULT_MAX_DELIVERY_COUNT)
    }

    pub fn with_max_delivery_count(max_delivery_count: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                failing_sends: Mutex::new(HashSet::new()),
                fail_open: AtomicBool::new(false),
                next_message_id: AtomicU64::new(0),
                next_receiver_id: AtomicU64::new(0),
                open_receivers: AtomicUsize::new(0),
                max_delivery_count,
            }),
        }
    }

    /// Put a message straight onto a queue, bypassing injected send failures
    pub fn enqueue(&self, queue: &str, message: QueueMessage) -> i64 {
        self.inner.push(queue, message)
    }

    /// Make every subsequent `send` to `queue` fail
    pub fn fail_sends_to(&self, queue: &str) {
        self.inner.failing_sends.lock().insert(queue.to_string());
    }

    pub fn restore_sends_to(&self, queue: &str) {
        self.inner.failing_sends.lock().remove(queue);
    }

    /// Make opening receivers fail
    pub fn fail_receiver_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Messages currently stored on `queue`, visible or not
    pub fn messages(&self, queue: &str) -> Vec<QueueMessage> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|state| state.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|state| state.messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Every message ever placed on `queue`, in order
    pub fn sent(&self, queue: &str) -> Vec<QueueMessage> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|state| state.sent.clone())
            .unwrap_or_default()
    }

    pub fn open_receiver_count(&self) -> usize {
        self.inner.open_receivers.load(Ordering::SeqCst)
    }

    fn receiver(&self, queue: String, dead_letter_queue: Option<String>) -> MessagingResult<Arc<dyn QueueReceiver>> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(MessagingError::queue_operation(
                &queue,
                "open_receiver",
                "receiver open refused",
            ));
        }
        self.inner.open_receivers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryReceiver {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_receiver_id.fetch_add(1, Ordering::SeqCst) + 1,
            queue,
            dead_letter_queue,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn send(&self, queue: &str, message: &QueueMessage) -> MessagingResult<i64> {
        if self.inner.failing_sends.lock().contains(queue) {
            return Err(MessagingError::queue_operation(queue, "send", "send refused"));
        }
        Ok(self.inner.push(queue, message.clone()))
    }

    async fn open_receiver(&self, queue: &str) -> MessagingResult<Arc<dyn QueueReceiver>> {
        self.receiver(queue.to_string(), Some(dead_letter_queue_name(queue)))
    }

    async fn open_dead_letter_receiver(
        &self,
        queue: &str,
    ) -> MessagingResult<Arc<dyn QueueReceiver>> {
        self.receiver(dead_letter_queue_name(queue), None)
    }
}

struct InMemoryReceiver {
    inner: Arc<Inner>,
    id: u64,
    queue: String,
    dead_letter_queue: Option<String>,
    closed: AtomicBool,
}

#[async_trait]
impl QueueReceiver for InMemoryReceiver {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, max: usize) -> MessagingResult<Vec<Delivery>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::receiver_closed(&self.queue));
        }

        let mut queues = self.inner.queues.lock();
        let Some(state) = queues.get_mut(&self.queue) else {
            return Ok(Vec::new());
        };

        Ok(state
            .messages
            .iter_mut()
            .filter(|stored| stored.claimed_by.is_none())
            .take(max)
            .map(|stored| {
                stored.claimed_by = Some(self.id);
                stored.read_count += 1;
                Delivery {
                    delivery_id: stored.id,
                    delivery_count: stored.read_count,
                    message: stored.message.clone(),
                }
            })
            .collect())
    }

    async fn complete(&self, delivery: &Delivery) -> MessagingResult<()> {
        let mut queues = self.inner.queues.lock();
        if let Some(state) = queues.get_mut(&self.queue) {
            state.messages.retain(|stored| stored.id != delivery.delivery_id);
        }
        Ok(())
    }

    async fn abandon(&self, delivery: &Delivery) -> MessagingResult<()> {
        let parked = {
            let mut queues = self.inner.queues.lock();
            let Some(state) = queues.get_mut(&self.queue) else {
                return Ok(());
            };
            let Some(position) = state
                .messages
                .iter()
                .position(|stored| stored.id == delivery.delivery_id)
            else {
                return Ok(());
            };

            let exhausted = state.messages[position].read_count >= self.inner.max_delivery_count;
            match (&self.dead_letter_queue, exhausted) {
                (Some(dead_letter_queue), true) => state
                    .messages
                    .remove(position)
                    .map(|stored| (dead_letter_queue.clone(), stored.message)),
                _ => {
                    state.messages[position].claimed_by = None;
                    None
                }
            }
        };

        if let Some((dead_letter_queue, message)) = parked {
            self.inner.push(&dead_letter_queue, message);
        }
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut queues = self.inner.queues.lock();
        if let Some(state) = queues.get_mut(&self.queue) {
            for stored in state.messages.iter_mut() {
                if stored.claimed_by == Some(self.id) {
                    stored.claimed_by = None;
                }
            }
        }
        self.inner.open_receivers.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Envelope with an arbitrary JSON body, handy for seeding queues in tests
pub fn raw_message(message_id: &str, body: serde_json::Value) -> QueueMessage {
    QueueMessage::unlabelled(message_id, body, Utc::now())
}
