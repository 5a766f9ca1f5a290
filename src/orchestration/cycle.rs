//! # Poll Cycle Orchestrator
//!
//! One invocation of the poller:
//!
//! ```text
//! Idle ──▶ WindowCheck ──too soon──▶ Skipped ──▶ Idle
//!               │
//!               └─proceed─▶ Draining ──▶ Consuming ──▶ Finalizing ──▶ Idle
//!                              ╰── pipeline: tokens ▶ search ▶ transform ▶ publish ──╯
//! ```
//!
//! The dead-letter drain and then the live consume session run under watchdogs while the
//! case pipeline runs beside them. The window advance is settled as soon as the pipeline
//! returns: kept when publishing succeeded, rolled back otherwise. Session failures are
//! reported but never affect the window.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::pipeline::CasePipeline;
use super::report::{CycleOutcome, CycleReport, PipelineReport, SessionReport, SessionStatus};
use crate::clock::Clock;
use crate::config::PollConfig;
use crate::consumer::{ConsumerSession, SessionFactory, SessionKind, WatchdogFactory};
use crate::error::{PollerError, PollerResult};
use crate::logging::log_cycle_operation;
use crate::metrics;
use crate::run_window::{RunWindowGuard, WindowDecision, WindowReservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Idle,
    WindowCheck,
    Skipped,
    Draining,
    Consuming,
    Finalizing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::WindowCheck => "window_check",
            CyclePhase::Skipped => "skipped",
            CyclePhase::Draining => "draining",
            CyclePhase::Consuming => "consuming",
            CyclePhase::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Pipeline result after the window has been kept or rolled back
struct Settlement {
    pipeline: PipelineReport,
    rollback_reason: Option<String>,
}

pub struct PollCycleOrchestrator {
    guard: Arc<RunWindowGuard>,
    pipeline: Arc<CasePipeline>,
    sessions: Arc<dyn SessionFactory>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    cycle_deadline: chrono::Duration,
    phase: RwLock<CyclePhase>,
}

impl PollCycleOrchestrator {
    pub fn new(
        guard: Arc<RunWindowGuard>,
        pipeline: Arc<CasePipeline>,
        sessions: Arc<dyn SessionFactory>,
        clock: Arc<dyn Clock>,
        poll: &PollConfig,
    ) -> Self {
        Self {
            guard,
            pipeline,
            sessions,
            clock,
            idle_timeout: poll.idle_timeout(),
            cycle_deadline: poll.cycle_deadline(),
            phase: RwLock::new(CyclePhase::Idle),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    pub fn guard(&self) -> &Arc<RunWindowGuard> {
        &self.guard
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
    }

    /// Run one cycle.
    ///
    /// Only a failure to read or advance the run window is returned as an error; every
    /// other failure is folded into the report. Cancelling `shutdown` stops the active
    /// session through its watchdog and keeps the live session from starting.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> PollerResult<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", cycle_id = %cycle_id);

        async {
            let result = self.run_phases(cycle_id, shutdown).await;
            self.set_phase(CyclePhase::Idle);

            match &result {
                Ok(report) => {
                    metrics::cycles_total()
                        .add(1, &[KeyValue::new("outcome", report.outcome.as_str())]);
                    log_cycle_operation(
                        "run_cycle",
                        &cycle_id.to_string(),
                        report.outcome.as_str(),
                        Some(&report.summary()),
                    );
                }
                Err(e) => {
                    metrics::cycles_total().add(1, &[KeyValue::new("outcome", "window_error")]);
                    error!(error = %e, "🔄 CYCLE: Could not check the run window");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        cycle_id: Uuid,
        shutdown: &CancellationToken,
    ) -> PollerResult<CycleReport> {
        self.set_phase(CyclePhase::WindowCheck);
        let now = self.clock.now();

        let reservation = match self.guard.try_advance(now).await? {
            WindowDecision::TooSoon { minutes_since_last } => {
                self.set_phase(CyclePhase::Skipped);
                return Ok(CycleReport::skipped(cycle_id, minutes_since_last));
            }
            WindowDecision::Proceed(reservation) => reservation,
        };

        let deadline = reservation.advanced_to + self.cycle_deadline;
        info!(
            window_start = %reservation.previous,
            window_end = %reservation.advanced_to,
            deadline = %deadline,
            "🔄 CYCLE: Starting poll cycle"
        );

        let (sessions, settlement) = tokio::join!(
            self.supervise_sessions(deadline, shutdown),
            self.run_pipeline(&reservation)
        );

        self.set_phase(CyclePhase::Finalizing);
        let outcome = match settlement.rollback_reason {
            Some(reason) => CycleOutcome::RolledBack { reason },
            None => {
                let reasons: Vec<String> = sessions
                    .iter()
                    .filter(|s| !s.is_clean())
                    .map(describe_session_problem)
                    .collect();
                if reasons.is_empty() {
                    CycleOutcome::Complete
                } else {
                    CycleOutcome::Partial { reasons }
                }
            }
        };

        let window_end = if outcome.is_rolled_back() {
            reservation.previous
        } else {
            reservation.advanced_to
        };

        Ok(CycleReport {
            cycle_id,
            outcome,
            window_start: Some(reservation.previous),
            window_end: Some(window_end),
            pipeline: settlement.pipeline,
            sessions,
        })
    }

    async fn run_pipeline(&self, reservation: &WindowReservation) -> Settlement {
        match self
            .pipeline
            .run(reservation.previous, reservation.advanced_to)
            .await
        {
            Ok(pipeline) => {
                self.guard.commit(reservation);
                Settlement {
                    pipeline,
                    rollback_reason: None,
                }
            }
            Err(e) => {
                error!(error = %e, stage = ?e.stage(), "🔄 CYCLE: Pipeline failed, rolling back run window");
                let reason = match self.guard.rollback(reservation).await {
                    Ok(_) => e.to_string(),
                    Err(rollback_error) => {
                        error!(error = %rollback_error, "🪟 WINDOW: Rollback failed");
                        format!("{e}; rollback failed: {rollback_error}")
                    }
                };
                Settlement {
                    pipeline: PipelineReport::default(),
                    rollback_reason: Some(reason),
                }
            }
        }
    }

    /// Drain, then consume. The live session is only created once the drain has
    /// completed, whether or not it succeeded.
    async fn supervise_sessions(
        &self,
        deadline: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Vec<SessionReport> {
        let watchdogs = WatchdogFactory::new(
            Arc::clone(&self.clock),
            self.idle_timeout,
            shutdown.child_token(),
        );

        self.set_phase(CyclePhase::Draining);
        let drain = run_session(self.sessions.dead_letter_drain(deadline), &watchdogs).await;

        if shutdown.is_cancelled() {
            warn!("🔄 CYCLE: Shutdown requested, not starting live consumption");
            return vec![drain, SessionReport::not_started(SessionKind::LiveConsume)];
        }

        self.set_phase(CyclePhase::Consuming);
        let live = run_session(self.sessions.live_consume(deadline), &watchdogs).await;
        vec![drain, live]
    }
}

impl fmt::Debug for PollCycleOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollCycleOrchestrator")
            .field("phase", &self.phase())
            .field("idle_timeout", &self.idle_timeout)
            .field("cycle_deadline", &self.cycle_deadline)
            .finish_non_exhaustive()
    }
}

async fn run_session(session: Arc<dyn ConsumerSession>, watchdogs: &WatchdogFactory) -> SessionReport {
    let kind = session.kind();
    let status = match Arc::clone(&session).start(watchdogs).await {
        Ok(completion) => {
            completion.wait().await;
            SessionStatus::Completed
        }
        Err(e) => {
            log_session_failure(kind, &e);
            SessionStatus::Failed {
                error: e.to_string(),
            }
        }
    };

    SessionReport {
        kind,
        status,
        stats: session.state().stats(),
        expiry_reason: session.expiry_reason(),
    }
}

fn log_session_failure(kind: SessionKind, err: &PollerError) {
    error!(session = %kind, error = %err, "🔄 CYCLE: Consumer session failed");
}

fn describe_session_problem(report: &SessionReport) -> String {
    match &report.status {
        SessionStatus::Failed { error } => format!("{} failed: {error}", report.kind),
        SessionStatus::NotStarted => format!("{} not started", report.kind),
        SessionStatus::Completed => format!("{} completed", report.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::case_source::{CaseSourceGateway, SearchResult, StandardCaseTransformer};
    use crate::clock::TokioClock;
    use crate::config::{CaseCategory, QueueConfig};
    use crate::consumer::QueueSessionFactory;
    use crate::error::PipelineStage;
    use crate::messaging::{InMemoryTransport, TaskPublisher};
    use crate::notification::LoggingNotificationSink;
    use crate::run_window::InMemoryRunWindowStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct EmptySource {
        fail: bool,
    }

    #[async_trait]
    impl CaseSourceGateway for EmptySource {
        async fn search(
            &self,
            _user_token: &str,
            _service_token: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _category: &CaseCategory,
        ) -> PollerResult<SearchResult> {
            if self.fail {
                Err(PollerError::pipeline(PipelineStage::CaseSource, "unavailable"))
            } else {
                Ok(SearchResult::empty())
            }
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 9, 25, h, m, 0).unwrap()
    }

    fn orchestrator(
        last_run: DateTime<Utc>,
        transport: &InMemoryTransport,
        fail_source: bool,
    ) -> PollCycleOrchestrator {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(12, 35)));
        let poll = PollConfig::default();
        let store = Arc::new(InMemoryRunWindowStore::with_last_run(last_run));
        let guard = Arc::new(RunWindowGuard::new(
            store,
            Arc::clone(&clock),
            poll.min_interval_minutes,
            poll.lookback_days,
        ));
        let transport: Arc<InMemoryTransport> = Arc::new(transport.clone());
        let pipeline = Arc::new(CasePipeline::new(
            Arc::new(StaticTokenProvider::new("s2s", "Bearer user")),
            Arc::new(EmptySource { fail: fail_source }),
            Arc::new(StandardCaseTransformer),
            TaskPublisher::new(
                transport.clone(),
                "case_tasks",
                chrono::Duration::days(7),
                Arc::clone(&clock),
            ),
            vec![CaseCategory::new("DIVORCE")],
            poll.query_offset(),
        ));
        let sessions = Arc::new(QueueSessionFactory::new(
            transport,
            Arc::new(LoggingNotificationSink),
            Arc::clone(&clock),
            QueueConfig::default(),
            "http://viewer/",
        ));
        PollCycleOrchestrator::new(guard, pipeline, sessions, clock, &poll)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cycle_completes_and_keeps_advance() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(at(12, 0), &transport, false);

        let report = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Complete);
        assert_eq!(report.window_end, Some(at(12, 35)));
        assert_eq!(report.sessions.len(), 2);
        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        assert_eq!(orchestrator.guard().last_run().await.unwrap(), Some(at(12, 35)));
    }

    #[tokio::test(start_paused = true)]
    async fn too_soon_is_skipped() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(at(12, 20), &transport, false);

        let report = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Skipped { minutes_since_last: 15 });
        assert!(report.sessions.is_empty());
        assert_eq!(orchestrator.guard().last_run().await.unwrap(), Some(at(12, 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_failure_rolls_back() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(at(12, 0), &transport, true);

        let report = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert!(report.outcome.is_rolled_back());
        assert_eq!(report.window_end, Some(at(12, 0)));
        assert_eq!(orchestrator.guard().last_run().await.unwrap(), Some(at(12, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cycle_skips_live_consumption() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(at(12, 0), &transport, false);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = orchestrator.run_cycle(&shutdown).await.unwrap();

        let live = report.session(SessionKind::LiveConsume).unwrap();
        assert_eq!(live.status, SessionStatus::NotStarted);
        assert!(matches!(report.outcome, CycleOutcome::Partial { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn session_transport_failure_does_not_abort_cycle() {
        let transport = InMemoryTransport::new();
        transport.fail_receiver_open(true);
        let orchestrator = orchestrator(at(12, 0), &transport, false);

        let report = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        match &report.outcome {
            CycleOutcome::Partial { reasons } => assert_eq!(reasons.len(), 2),
            other => panic!("expected partial outcome, got {other:?}"),
        }
        assert_eq!(orchestrator.guard().last_run().await.unwrap(), Some(at(12, 35)));
    }
}
