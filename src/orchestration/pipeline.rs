//! Fetch, transform, publish.
//!
//! Runs alongside the consumer sessions. Any error leaving [`CasePipeline::run`] is a
//! `PipelineFatal` tagged with the stage that failed, and the orchestrator rolls the
//! window back when it sees one.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, info};

use super::report::PipelineReport;
use crate::auth::TokenProvider;
use crate::case_source::{transform_batch, CaseSourceGateway, CaseTransformer};
use crate::config::CaseCategory;
use crate::error::{PipelineStage, PollerError, PollerResult};
use crate::messaging::TaskPublisher;
use crate::metrics;

pub struct CasePipeline {
    tokens: Arc<dyn TokenProvider>,
    case_source: Arc<dyn CaseSourceGateway>,
    transformer: Arc<dyn CaseTransformer>,
    publisher: TaskPublisher,
    categories: Vec<CaseCategory>,
    query_offset: chrono::Duration,
}

impl CasePipeline {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        case_source: Arc<dyn CaseSourceGateway>,
        transformer: Arc<dyn CaseTransformer>,
        publisher: TaskPublisher,
        categories: Vec<CaseCategory>,
        query_offset: chrono::Duration,
    ) -> Self {
        Self {
            tokens,
            case_source,
            transformer,
            publisher,
            categories,
            query_offset,
        }
    }

    pub fn categories(&self) -> &[CaseCategory] {
        &self.categories
    }

    /// Search bounds for a window; both ends trail the window by the query offset
    pub fn query_bounds(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        (window_start - self.query_offset, window_end - self.query_offset)
    }

    pub async fn run(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> PollerResult<PipelineReport> {
        let (service_token, user_token) = tokio::try_join!(
            self.tokens.service_token(),
            self.tokens.user_token()
        )
        .map_err(|e| e.in_stage(PipelineStage::Auth))?;

        let (from, to) = self.query_bounds(window_start, window_end);
        debug!(from = %from, to = %to, categories = self.categories.len(), "🔎 CASES: Querying window");

        let mut report = PipelineReport::default();
        let mut tasks = Vec::new();

        for category in &self.categories {
            let result = self
                .case_source
                .search(&user_token, &service_token, from, to, category)
                .await
                .map_err(|e| e.in_stage(PipelineStage::CaseSource))?;

            info!(
                case_type_id = %category.case_type_id,
                total = result.total,
                "🔎 CASES: Total number of cases"
            );
            metrics::cases_found_total().add(
                result.total,
                &[KeyValue::new("case_type_id", category.case_type_id.clone())],
            );

            let (found, discarded) = transform_batch(&result.cases, category, self.transformer.as_ref());
            *report
                .cases_by_category
                .entry(category.case_type_id.clone())
                .or_default() += result.total;
            report.discarded += discarded;
            tasks.extend(found);
        }

        info!(count = tasks.len(), "🔎 CASES: Total number of tasks");

        report.tasks_published = self
            .publisher
            .publish(&tasks)
            .await
            .map_err(PollerError::from)?;
        Ok(report)
    }
}

impl std::fmt::Debug for CasePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasePipeline")
            .field("categories", &self.categories)
            .field("query_offset", &self.query_offset)
            .field("queue", &self.publisher.queue_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::case_source::{RawCaseRecord, SearchResult, StandardCaseTransformer};
    use crate::clock::ManualClock;
    use crate::messaging::InMemoryTransport;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct ScriptedSource {
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CaseSourceGateway for ScriptedSource {
        async fn search(
            &self,
            user_token: &str,
            _service_token: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            category: &CaseCategory,
        ) -> PollerResult<SearchResult> {
            self.calls.lock().push((
                category.case_type_id.clone(),
                from,
                to,
                user_token.to_string(),
            ));
            if self.fail {
                return Err(PollerError::pipeline(PipelineStage::CaseSource, "503"));
            }
            Ok(SearchResult {
                total: 2,
                cases: vec![
                    RawCaseRecord::new(json!({
                        "id": format!("{}-1", category.case_type_id),
                        "jurisdiction": "DIVORCE",
                        "state": "Submitted",
                        "last_modified": "2019-09-25T12:10:00",
                    })),
                    RawCaseRecord::new(json!({ "id": "broken" })),
                ],
            })
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 9, 25, h, m, 0).unwrap()
    }

    fn pipeline(source: Arc<ScriptedSource>, transport: &InMemoryTransport) -> CasePipeline {
        let clock = Arc::new(ManualClock::new(at(12, 35)));
        CasePipeline::new(
            Arc::new(StaticTokenProvider::new("s2s", "Bearer user")),
            source,
            Arc::new(StandardCaseTransformer),
            TaskPublisher::new(
                Arc::new(transport.clone()),
                "case_tasks",
                chrono::Duration::days(7),
                clock,
            ),
            vec![CaseCategory::new("DIVORCE"), CaseCategory::new("Caveat")],
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn queries_every_category_with_offset_bounds() {
        let source = Arc::new(ScriptedSource::default());
        let transport = InMemoryTransport::new();

        let report = pipeline(Arc::clone(&source), &transport)
            .run(at(12, 0), at(12, 35))
            .await
            .unwrap();

        let calls = source.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "DIVORCE");
        assert_eq!(calls[1].0, "Caveat");
        assert_eq!((calls[0].1, calls[0].2), (at(11, 55), at(12, 30)));
        assert_eq!(calls[0].3, "Bearer user");

        assert_eq!(report.cases_found(), 4);
        assert_eq!(report.discarded, 2);
        assert_eq!(report.tasks_published, 2);
        assert_eq!(transport.len("case_tasks"), 2);
    }

    #[tokio::test]
    async fn source_failure_publishes_nothing() {
        let source = Arc::new(ScriptedSource {
            fail: true,
            ..ScriptedSource::default()
        });
        let transport = InMemoryTransport::new();

        let err = pipeline(source, &transport)
            .run(at(12, 0), at(12, 35))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(PipelineStage::CaseSource));
        assert!(transport.is_empty("case_tasks"));
    }

    #[tokio::test]
    async fn publish_failure_is_fatal() {
        let transport = InMemoryTransport::new();
        transport.fail_sends_to("case_tasks");

        let err = pipeline(Arc::new(ScriptedSource::default()), &transport)
            .run(at(12, 0), at(12, 35))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(PipelineStage::Publish));
    }
}
