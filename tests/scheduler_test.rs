mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use case_poller::orchestration::PollScheduler;
use case_poller::run_window::RunWindowStore;
use common::*;

#[tokio::test(start_paused = true)]
async fn ticks_until_shutdown_and_only_one_cycle_runs_per_window() {
    let harness = Harness::new(at(12, 0), FakeCaseSource::with_records("DIVORCE", vec![good_record("1")]));
    let orchestrator = Arc::new(harness.orchestrator_at(at(12, 35)));
    let scheduler = PollScheduler::new(Arc::clone(&orchestrator), Duration::from_secs(60));
    let shutdown = CancellationToken::new();

    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    // Five minutes of ticks: one real cycle, the rest fall inside the 30 minute interval.
    tokio::time::sleep(Duration::from_secs(300)).await;
    shutdown.cancel();
    let attempts = running.await.unwrap();

    assert!(attempts >= 2, "only {attempts} attempts");
    assert_eq!(harness.source.calls(), 1);
    assert_eq!(harness.sent_bodies().len(), 1);
    assert_eq!(harness.store.last_run().await.unwrap(), Some(at(12, 35)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_first_tick_runs_nothing() {
    let harness = Harness::new(at(12, 0), FakeCaseSource::default());
    let scheduler = PollScheduler::new(
        Arc::new(harness.orchestrator_at(at(12, 35))),
        Duration::from_secs(60),
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    assert_eq!(scheduler.run(shutdown).await, 0);
    assert_eq!(harness.source.calls(), 0);
}
