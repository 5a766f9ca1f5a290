#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Case Poller
//!
//! Polls a case store for recently changed cases, turns them into tasks on a durable
//! queue, and drains that queue into a notification sink.
//!
//! ## Overview
//!
//! Each poll cycle is gated by a persisted run window: a cycle only runs when at least
//! `min_interval_minutes` have passed since the last one, and concurrent attempts are
//! serialized on a row lock so only one proceeds. A running cycle
//!
//! 1. drains the dead-letter queue back onto the live queue,
//! 2. then consumes the live queue into the notification sink,
//! 3. while, alongside both, it searches the case store for the window, transforms the
//!    records and publishes the resulting tasks.
//!
//! Both consumer sessions stop by themselves: a watchdog shuts each one down after
//! `idle_timeout_seconds` without a message, or at the cycle deadline. A pipeline failure
//! rolls the window back so the next cycle searches the same range again.
//!
//! ## Module Organization
//!
//! - [`run_window`] - Run window guard and its Postgres / in-memory stores
//! - [`consumer`] - Consumer sessions and the idle watchdog
//! - [`orchestration`] - Poll cycle state machine, pipeline and scheduler
//! - [`case_source`] - Case store search and record transformation
//! - [`auth`] - Service and user tokens
//! - [`messaging`] - Queue envelopes, pgmq and in-memory transports, task publisher
//! - [`notification`] - Where consumed tasks are delivered
//! - [`config`] - Layered configuration
//! - [`database`] - Connection pool and bundled migrations
//! - [`error`] - Structured error handling
//! - [`health`] - Liveness of the database, identity services and case store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use case_poller::config::ConfigManager;
//! use case_poller::orchestration::PollerSystem;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let system = PollerSystem::bootstrap(manager.config()).await?;
//!
//! let report = system.orchestrator().run_cycle(&CancellationToken::new()).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod case_source;
pub mod clock;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod orchestration;
pub mod run_window;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{ConfigManager, PollerConfig};
pub use consumer::{
    ConsumerSession, DeadLetterDrainSession, LiveConsumeSession, WatchdogFactory,
};
pub use error::{PipelineStage, PollerError, PollerResult};
pub use models::Task;
pub use orchestration::{
    CycleOutcome, CyclePhase, CycleReport, PollCycleOrchestrator, PollScheduler, PollerSystem,
};
pub use run_window::{RunWindowGuard, WindowDecision, WindowReservation};
