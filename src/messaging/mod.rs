//! # Messaging Module
//!
//! Queue envelopes, the transport abstraction and its pgmq and in-memory
//! implementations, and the task publisher.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod pgmq_transport;
pub mod publisher;
pub mod transport;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryTransport;
pub use message::{Delivery, QueueMessage};
pub use pgmq_transport::PgmqTransport;
pub use publisher::TaskPublisher;
pub use transport::{QueueReceiver, QueueTransport};
