//! # Consumer Sessions
//!
//! Short-lived, self-terminating queue consumers and the watchdog that ends them.
//!
//! Each poll cycle runs a [`DeadLetterDrainSession`] to completion and then a
//! [`LiveConsumeSession`]. Both stop on their own: the [`WatchdogFactory`] arms one
//! watchdog per session that shuts it down after `idle_timeout` without activity or at
//! the cycle deadline, whichever comes first.

pub mod dead_letter;
pub mod factory;
pub mod live;
pub mod session;
pub mod watchdog;

pub use dead_letter::DeadLetterDrainSession;
pub use factory::{QueueSessionFactory, SessionFactory};
pub use live::LiveConsumeSession;
pub use session::{
    ConsumerSession, HandlingOutcome, MessageHandler, SessionKind, SessionOptions, SessionRuntime,
    SessionState, SessionStats,
};
pub use watchdog::{
    evaluate, ActivityProbe, CompletionSignal, ExpireAction, ExpiryReason, WatchdogFactory,
    WatchdogHandle,
};
