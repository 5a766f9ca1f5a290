#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use case_poller::auth::{StaticTokenProvider, TokenProvider};
use case_poller::case_source::{CaseSourceGateway, RawCaseRecord, SearchResult, StandardCaseTransformer};
use case_poller::clock::{Clock, TokioClock};
use case_poller::config::{CaseCategory, PollConfig, QueueConfig};
use case_poller::consumer::{
    CompletionSignal, ConsumerSession, ExpiryReason, QueueSessionFactory, SessionFactory,
    SessionKind, SessionState, WatchdogFactory,
};
use case_poller::error::{PipelineStage, PollerError, PollerResult};
use case_poller::messaging::{InMemoryTransport, TaskPublisher};
use case_poller::models::Task;
use case_poller::notification::NotificationSink;
use case_poller::orchestration::{CasePipeline, PollCycleOrchestrator};
use case_poller::run_window::{InMemoryRunWindowStore, RunWindowGuard, RunWindowStore};

pub const QUEUE: &str = "case_tasks";

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 9, 25, h, m, 0).unwrap()
}

pub fn good_record(id: &str) -> RawCaseRecord {
    RawCaseRecord::new(json!({
        "id": id,
        "jurisdiction": "DIVORCE",
        "state": "Submitted",
        "case_type_id": "DIVORCE",
        "last_modified": "2019-09-25T12:10:00.000",
    }))
}

pub fn malformed_record(id: &str) -> RawCaseRecord {
    RawCaseRecord::new(json!({ "id": id, "state": "Submitted" }))
}

/// Case source that serves canned records per case type and records every call
#[derive(Default)]
pub struct FakeCaseSource {
    records: Mutex<HashMap<String, Vec<RawCaseRecord>>>,
    fail: AtomicBool,
    calls: AtomicUsize,
    windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl FakeCaseSource {
    pub fn with_records(case_type_id: &str, records: Vec<RawCaseRecord>) -> Self {
        let source = Self::default();
        source
            .records
            .lock()
            .insert(case_type_id.to_string(), records);
        source
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().clone()
    }
}

#[async_trait]
impl CaseSourceGateway for FakeCaseSource {
    async fn search(
        &self,
        _user_token: &str,
        _service_token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        category: &CaseCategory,
    ) -> PollerResult<SearchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.windows.lock().push((from, to));
        if self.fail.load(Ordering::SeqCst) {
            return Err(PollerError::pipeline(
                PipelineStage::CaseSource,
                "case store unavailable",
            ));
        }
        let cases = self
            .records
            .lock()
            .get(&category.case_type_id)
            .cloned()
            .unwrap_or_default();
        Ok(SearchResult {
            total: cases.len() as u64,
            cases,
        })
    }
}

pub struct FailingTokens;

#[async_trait]
impl TokenProvider for FailingTokens {
    async fn service_token(&self) -> PollerResult<String> {
        Ok("s2s".to_string())
    }

    async fn user_token(&self) -> PollerResult<String> {
        Err(PollerError::pipeline(PipelineStage::Auth, "invalid credentials"))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Task>>,
}

impl RecordingSink {
    pub fn delivered_ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, task: &Task, _deep_link_base_url: &str) -> PollerResult<()> {
        self.delivered.lock().push(task.clone());
        Ok(())
    }
}

/// Session wrapper that logs lifecycle events into a shared journal
pub struct JournaledSession {
    inner: Arc<dyn ConsumerSession>,
    journal: Arc<Mutex<Vec<String>>>,
    drain_completion: Arc<Mutex<Option<CompletionSignal>>>,
}

#[async_trait]
impl ConsumerSession for JournaledSession {
    fn kind(&self) -> SessionKind {
        self.inner.kind()
    }

    fn state(&self) -> &SessionState {
        self.inner.state()
    }

    async fn start(self: Arc<Self>, watchdogs: &WatchdogFactory) -> PollerResult<CompletionSignal> {
        let kind = self.inner.kind();
        if kind == SessionKind::LiveConsume {
            let drained = self
                .drain_completion
                .lock()
                .as_ref()
                .map(CompletionSignal::is_resolved)
                .unwrap_or(false);
            self.journal
                .lock()
                .push(format!("live_consume start (drain resolved: {drained})"));
        } else {
            self.journal.lock().push(format!("{kind} start"));
        }

        let completion = Arc::clone(&self.inner).start(watchdogs).await?;
        if kind == SessionKind::DeadLetterDrain {
            *self.drain_completion.lock() = Some(completion.clone());
        }
        Ok(completion)
    }

    async fn shutdown(&self) -> CompletionSignal {
        self.inner.shutdown().await
    }

    fn expiry_reason(&self) -> Option<ExpiryReason> {
        self.inner.expiry_reason()
    }
}

pub struct JournaledSessionFactory {
    inner: QueueSessionFactory,
    pub journal: Arc<Mutex<Vec<String>>>,
    drain_completion: Arc<Mutex<Option<CompletionSignal>>>,
}

impl JournaledSessionFactory {
    pub fn new(inner: QueueSessionFactory) -> Self {
        Self {
            inner,
            journal: Arc::new(Mutex::new(Vec::new())),
            drain_completion: Arc::new(Mutex::new(None)),
        }
    }

    fn wrap(&self, inner: Arc<dyn ConsumerSession>) -> Arc<dyn ConsumerSession> {
        Arc::new(JournaledSession {
            inner,
            journal: Arc::clone(&self.journal),
            drain_completion: Arc::clone(&self.drain_completion),
        })
    }
}

impl SessionFactory for JournaledSessionFactory {
    fn dead_letter_drain(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession> {
        self.journal.lock().push("dead_letter_drain created".to_string());
        self.wrap(self.inner.dead_letter_drain(deadline))
    }

    fn live_consume(&self, deadline: DateTime<Utc>) -> Arc<dyn ConsumerSession> {
        self.journal.lock().push("live_consume created".to_string());
        self.wrap(self.inner.live_consume(deadline))
    }
}

/// Everything a poll cycle needs, backed by in-memory doubles
pub struct Harness {
    pub store: Arc<InMemoryRunWindowStore>,
    pub transport: InMemoryTransport,
    pub source: Arc<FakeCaseSource>,
    pub sink: Arc<RecordingSink>,
    pub tokens: Arc<dyn TokenProvider>,
    pub poll: PollConfig,
}

impl Harness {
    pub fn new(last_run: DateTime<Utc>, source: FakeCaseSource) -> Self {
        Self {
            store: Arc::new(InMemoryRunWindowStore::with_last_run(last_run)),
            transport: InMemoryTransport::new(),
            source: Arc::new(source),
            sink: Arc::new(RecordingSink::default()),
            tokens: Arc::new(StaticTokenProvider::new("s2s", "Bearer user")),
            poll: PollConfig::default(),
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn session_factory(&self, clock: Arc<dyn Clock>) -> QueueSessionFactory {
        QueueSessionFactory::new(
            Arc::new(self.transport.clone()),
            Arc::clone(&self.sink) as Arc<dyn NotificationSink>,
            clock,
            QueueConfig::default(),
            "http://viewer/cases/",
        )
    }

    /// Orchestrator whose clock reads `start` when the runtime's virtual time is now
    pub fn orchestrator_at(&self, start: DateTime<Utc>) -> PollCycleOrchestrator {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(start));
        let sessions = Arc::new(self.session_factory(Arc::clone(&clock)));
        self.orchestrator_with(clock, sessions)
    }

    pub fn orchestrator_with(
        &self,
        clock: Arc<dyn Clock>,
        sessions: Arc<dyn SessionFactory>,
    ) -> PollCycleOrchestrator {
        let store: Arc<dyn RunWindowStore> = self.store.clone();
        let guard = Arc::new(RunWindowGuard::new(
            store,
            Arc::clone(&clock),
            self.poll.min_interval_minutes,
            self.poll.lookback_days,
        ));
        let pipeline = Arc::new(CasePipeline::new(
            Arc::clone(&self.tokens),
            Arc::clone(&self.source) as Arc<dyn CaseSourceGateway>,
            Arc::new(StandardCaseTransformer),
            TaskPublisher::new(
                Arc::new(self.transport.clone()),
                QUEUE,
                chrono::Duration::days(7),
                Arc::clone(&clock),
            ),
            vec![CaseCategory::new("DIVORCE")],
            self.poll.query_offset(),
        ));
        PollCycleOrchestrator::new(guard, pipeline, sessions, clock, &self.poll)
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.transport
            .messages(QUEUE)
            .into_iter()
            .map(|m| m.message_id)
            .collect()
    }

    pub fn sent_bodies(&self) -> Vec<Value> {
        self.transport
            .sent(QUEUE)
            .into_iter()
            .map(|m| m.body)
            .collect()
    }
}
