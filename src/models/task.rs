//! # Task Model
//!
//! The normalized unit of work derived from a changed case. A `Task` is what the
//! pipeline publishes and what the live consume session hands to the notification sink.
//!
//! Tasks are plain values: built once, compared by value, serialized as snake_case JSON.
//!
//! ```json
//! {
//!   "id": "1563460551495313",
//!   "state": "Submitted",
//!   "jurisdiction": "DIVORCE",
//!   "case_type_id": "DIVORCE",
//!   "last_modified_date": "2019-07-18T14:36:25.862"
//! }
//! ```

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Case timestamps arrive as local date-times without an offset
pub const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    id: String,
    state: String,
    jurisdiction: String,
    case_type_id: String,
    last_modified_date: NaiveDateTime,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        state: impl Into<String>,
        jurisdiction: impl Into<String>,
        case_type_id: impl Into<String>,
        last_modified_date: NaiveDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            state: state.into(),
            jurisdiction: jurisdiction.into(),
            case_type_id: case_type_id.into(),
            last_modified_date,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    pub fn case_type_id(&self) -> &str {
        &self.case_type_id
    }

    pub fn last_modified_date(&self) -> NaiveDateTime {
        self.last_modified_date
    }
}
