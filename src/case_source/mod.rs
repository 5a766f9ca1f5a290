//! # Case Source
//!
//! Searching the case store for cases modified inside the poll window, and turning the
//! raw records it returns into [`Task`](crate::models::Task)s.
//!
//! One search is issued per configured [`CaseCategory`]. The gateway only moves JSON;
//! interpretation of the records is the [`CaseTransformer`]'s job, and a record that
//! cannot be interpreted is discarded on its own without failing the batch.

pub mod http;
pub mod transform;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CaseCategory;
use crate::error::PollerResult;

pub use http::HttpCaseSourceGateway;
pub use transform::{transform_batch, CaseTransformer, StandardCaseTransformer};

/// One case as returned by the case source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCaseRecord(pub Value);

impl RawCaseRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Identifier for log lines, whatever shape it has
    pub fn display_id(&self) -> String {
        match self.field("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => "<unknown>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub cases: Vec<RawCaseRecord>,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait CaseSourceGateway: Send + Sync {
    /// Cases of `category` whose last modification falls in `(from, to]`
    async fn search(
        &self,
        user_token: &str,
        service_token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        category: &CaseCategory,
    ) -> PollerResult<SearchResult>;
}
