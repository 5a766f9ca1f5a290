use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::{CaseSourceGateway, SearchResult};
use crate::config::{CaseCategory, CaseSourceConfig};
use crate::error::{PipelineStage, PollerError, PollerResult};

/// Timestamps in the range query carry no offset and no fraction
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Largest page the case store returns for one search
const QUERY_PAGE_SIZE: u64 = 1000;

const SOURCE_FIELDS: [&str; 5] = ["reference", "jurisdiction", "state", "last_modified", "case_type_id"];

/// Searches the case store's `searchCases` endpoint
#[derive(Debug, Clone)]
pub struct HttpCaseSourceGateway {
    client: Client,
    base_url: String,
    dry_run: bool,
}

impl HttpCaseSourceGateway {
    pub fn new(config: &CaseSourceConfig) -> PollerResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                PollerError::configuration(format!("Failed to build case source HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dry_run: config.dry_run,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Range query on `last_modified` (`gt from`, `lte to`) plus the category's filters
    pub fn build_query(from: DateTime<Utc>, to: DateTime<Utc>, category: &CaseCategory) -> Value {
        let mut must = vec![json!({
            "range": {
                "last_modified": {
                    "gt": from.format(QUERY_TIME_FORMAT).to_string(),
                    "lte": to.format(QUERY_TIME_FORMAT).to_string(),
                }
            }
        })];

        if !category.states.is_empty() {
            must.push(json!({ "terms": { "state": category.states } }));
        }
        if let Some(filter) = &category.filter {
            must.push(filter.clone());
        }

        json!({
            "query": { "bool": { "must": must } },
            "_source": SOURCE_FIELDS,
            "size": QUERY_PAGE_SIZE,
        })
    }
}

#[async_trait]
impl CaseSourceGateway for HttpCaseSourceGateway {
    async fn search(
        &self,
        user_token: &str,
        service_token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        category: &CaseCategory,
    ) -> PollerResult<SearchResult> {
        if self.dry_run {
            info!(case_type_id = %category.case_type_id, "🔎 CASES: Dry run, not contacting the case store");
            return Ok(SearchResult::empty());
        }

        let url = format!("{}/searchCases", self.base_url);
        let query = Self::build_query(from, to, category);
        debug!(
            case_type_id = %category.case_type_id,
            from = %from,
            to = %to,
            "🔎 CASES: Searching"
        );

        let response = self
            .client
            .post(&url)
            .query(&[("ctid", category.case_type_id.as_str())])
            .header(reqwest::header::AUTHORIZATION, user_token)
            .header("ServiceAuthorization", service_token)
            .json(&query)
            .send()
            .await
            .map_err(|e| source_error(&category.case_type_id, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                case_type_id = %category.case_type_id,
                status = %status,
                "🔎 CASES: Case store rejected search"
            );
            return Err(PollerError::pipeline(
                PipelineStage::CaseSource,
                format!("search for {} returned {status}: {body}", category.case_type_id),
            ));
        }

        let result: SearchResult = response
            .json()
            .await
            .map_err(|e| source_error(&category.case_type_id, e))?;
        info!(
            case_type_id = %category.case_type_id,
            total = result.total,
            "🔎 CASES: Search complete"
        );
        Ok(result)
    }
}

fn source_error(case_type_id: &str, err: reqwest::Error) -> PollerError {
    error!(case_type_id = %case_type_id, error = %err, "🔎 CASES: Failed to reach the case store");
    PollerError::pipeline(
        PipelineStage::CaseSource,
        format!("search for {case_type_id} failed: {err}"),
    )
}
