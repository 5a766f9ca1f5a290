//! # Poll Cycle Orchestration
//!
//! Coordinates one poll cycle end to end:
//!
//! - [`cycle`] - `PollCycleOrchestrator`, the run-window gated state machine
//! - [`pipeline`] - token acquisition, case search, transformation and publishing
//! - [`report`] - `CycleReport` and its one-line summary
//! - [`scheduler`] - recurring timer trigger
//! - [`enqueue`] - single operator-supplied tasks, checked before publishing
//! - [`bootstrap`] - production wiring from configuration

pub mod bootstrap;
pub mod cycle;
pub mod enqueue;
pub mod pipeline;
pub mod report;
pub mod scheduler;

pub use bootstrap::PollerSystem;
pub use cycle::{CyclePhase, PollCycleOrchestrator};
pub use enqueue::{ManualTaskEnqueuer, TaskAdmission};
pub use pipeline::CasePipeline;
pub use report::{CycleOutcome, CycleReport, PipelineReport, SessionReport, SessionStatus};
pub use scheduler::PollScheduler;
