//! Raw case record → [`Task`].

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::warn;

use super::RawCaseRecord;
use crate::config::CaseCategory;
use crate::error::{PollerError, PollerResult};
use crate::metrics;
use crate::models::{Task, LAST_MODIFIED_FORMAT};

pub trait CaseTransformer: Send + Sync {
    fn transform(&self, record: &RawCaseRecord, category: &CaseCategory) -> PollerResult<Task>;
}

/// Reads `id`, `jurisdiction`, `state`, `case_type_id` and `last_modified` from the record.
///
/// `case_type_id` falls back to the category's when the record omits it, and a category
/// with an `evidence_flow` overrides the record's state.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCaseTransformer;

impl CaseTransformer for StandardCaseTransformer {
    fn transform(&self, record: &RawCaseRecord, category: &CaseCategory) -> PollerResult<Task> {
        let id = match record.field("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(PollerError::case_transform(
                    record.display_id(),
                    "missing or invalid id",
                ))
            }
        };

        let jurisdiction = required_str(record, &id, "jurisdiction")?;

        let case_type_id = match record.field("case_type_id").and_then(Value::as_str) {
            Some(case_type_id) if !case_type_id.is_empty() => case_type_id.to_string(),
            _ => category.case_type_id.clone(),
        };

        let state = match &category.evidence_flow {
            Some(flow) => flow.clone(),
            None => required_str(record, &id, "state")?,
        };

        let raw_modified = required_str(record, &id, "last_modified")?;
        let last_modified = NaiveDateTime::parse_from_str(&raw_modified, LAST_MODIFIED_FORMAT)
            .map_err(|e| {
                PollerError::case_transform(&id, format!("unparseable last_modified {raw_modified:?}: {e}"))
            })?;

        Ok(Task::new(id, state, jurisdiction, case_type_id, last_modified))
    }
}

fn required_str(record: &RawCaseRecord, id: &str, field: &str) -> PollerResult<String> {
    match record.field(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(PollerError::case_transform(id, format!("missing {field}"))),
    }
}

/// Transform every record, discarding the ones that fail.
///
/// Returns the tasks in input order and the number discarded.
pub fn transform_batch(
    records: &[RawCaseRecord],
    category: &CaseCategory,
    transformer: &dyn CaseTransformer,
) -> (Vec<Task>, usize) {
    let mut tasks = Vec::with_capacity(records.len());
    let mut discarded = 0;

    for record in records {
        match transformer.transform(record, category) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                discarded += 1;
                warn!(
                    case_type_id = %category.case_type_id,
                    case_id = %record.display_id(),
                    error = %e,
                    "🔎 CASES: Discarding case record"
                );
            }
        }
    }

    if discarded > 0 {
        metrics::records_discarded_total().add(
            discarded as u64,
            &[opentelemetry::KeyValue::new(
                "case_type_id",
                category.case_type_id.clone(),
            )],
        );
    }
    (tasks, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(id: Value) -> RawCaseRecord {
        RawCaseRecord::new(json!({
            "id": id,
            "jurisdiction": "DIVORCE",
            "state": "Submitted",
            "case_type_id": "DIVORCE",
            "last_modified": "2019-09-25T12:10:00.123",
        }))
    }

    #[test]
    fn numeric_and_string_ids_are_accepted() {
        let category = CaseCategory::new("DIVORCE");
        let from_number = StandardCaseTransformer
            .transform(&record(json!(1563460551495313u64)), &category)
            .unwrap();
        let from_string = StandardCaseTransformer
            .transform(&record(json!("1563460551495313")), &category)
            .unwrap();

        assert_eq!(from_number, from_string);
        assert_eq!(from_number.id(), "1563460551495313");
        assert_eq!(
            from_number.last_modified_date().format(LAST_MODIFIED_FORMAT).to_string(),
            "2019-09-25T12:10:00.123"
        );
    }

    #[test]
    fn case_type_falls_back_to_category() {
        let raw = RawCaseRecord::new(json!({
            "id": "7",
            "jurisdiction": "PROBATE",
            "state": "CaveatRaised",
            "last_modified": "2019-09-25T12:10:00",
        }));
        let task = StandardCaseTransformer
            .transform(&raw, &CaseCategory::new("Caveat"))
            .unwrap();
        assert_eq!(task.case_type_id(), "Caveat");
    }

    #[test]
    fn evidence_flow_replaces_state() {
        let category = CaseCategory {
            evidence_flow: Some("evidenceHandled".to_string()),
            ..CaseCategory::new("DIVORCE")
        };
        let task = StandardCaseTransformer
            .transform(&record(json!("1")), &category)
            .unwrap();
        assert_eq!(task.state(), "evidenceHandled");
    }

    #[test]
    fn malformed_records_are_rejected() {
        let category = CaseCategory::new("DIVORCE");
        let no_jurisdiction = RawCaseRecord::new(json!({
            "id": "1", "state": "Submitted", "last_modified": "2019-09-25T12:10:00"
        }));
        let bad_date = RawCaseRecord::new(json!({
            "id": "2", "jurisdiction": "DIVORCE", "state": "Submitted", "last_modified": "yesterday"
        }));
        let no_id = RawCaseRecord::new(json!({ "jurisdiction": "DIVORCE" }));

        for raw in [no_jurisdiction, bad_date, no_id] {
            let err = StandardCaseTransformer.transform(&raw, &category).unwrap_err();
            assert!(matches!(err, PollerError::CaseTransform { .. }), "{err}");
        }
    }

    proptest! {
        #[test]
        fn one_bad_record_never_costs_a_good_one(good in 0usize..20, bad_at in 0usize..21) {
            let category = CaseCategory::new("DIVORCE");
            let mut records: Vec<RawCaseRecord> =
                (0..good).map(|i| record(json!(i.to_string()))).collect();
            let bad_at = bad_at.min(records.len());
            records.insert(bad_at, RawCaseRecord::new(json!({ "id": "broken" })));

            let (tasks, discarded) = transform_batch(&records, &category, &StandardCaseTransformer);

            prop_assert_eq!(tasks.len(), good);
            prop_assert_eq!(discarded, 1);
            let ids: Vec<String> = tasks.iter().map(|t| t.id().to_string()).collect();
            let expected: Vec<String> = (0..good).map(|i| i.to_string()).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
