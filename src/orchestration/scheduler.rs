use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::cycle::PollCycleOrchestrator;

/// Timer trigger: one cycle attempt per tick until shutdown.
///
/// The run window, not the timer, decides whether an attempt does any work, so ticks
/// can be much more frequent than the minimum interval. A tick that falls while a
/// cycle is still running is dropped.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    orchestrator: Arc<PollCycleOrchestrator>,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(orchestrator: Arc<PollCycleOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Returns the number of cycle attempts made
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        info!(interval_seconds = self.interval.as_secs(), "⏱️ SCHEDULER: Starting poll trigger");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut attempts = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            attempts += 1;
            if let Err(e) = self.orchestrator.run_cycle(&shutdown).await {
                error!(error = %e, "⏱️ SCHEDULER: Cycle attempt failed");
            }
        }

        info!(attempts = attempts, "⏱️ SCHEDULER: Poll trigger stopped");
        attempts
    }
}
