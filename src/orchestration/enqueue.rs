//! # Manual Task Enqueue
//!
//! Places a single operator-supplied task on the live queue outside any poll cycle.
//! The task goes through the same publisher as the pipeline, so it carries the same
//! envelope and expiry, but it is checked first: its jurisdiction must be one that has
//! a notification recipient and its case type must be one the poller searches.

use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::PollerConfig;
use crate::error::{PollerError, PollerResult};
use crate::messaging::TaskPublisher;
use crate::models::Task;

/// Which tasks may be enqueued by hand
#[derive(Debug, Clone, Default)]
pub struct TaskAdmission {
    /// Stored upper-cased; jurisdictions compare case-insensitively
    jurisdictions: HashSet<String>,
    case_types: HashSet<String>,
}

impl TaskAdmission {
    pub fn new<J, C>(jurisdictions: J, case_types: C) -> Self
    where
        J: IntoIterator,
        J::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            jurisdictions: jurisdictions
                .into_iter()
                .map(|j| j.as_ref().to_uppercase())
                .collect(),
            case_types: case_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &PollerConfig) -> Self {
        Self::new(
            &config.notification.jurisdictions,
            config
                .case_source
                .categories
                .iter()
                .map(|category| category.case_type_id.clone()),
        )
    }

    pub fn check(&self, task: &Task) -> PollerResult<()> {
        if task.id().trim().is_empty() {
            return Err(PollerError::task_rejected(task.id(), "id is empty"));
        }
        if task.state().trim().is_empty() {
            return Err(PollerError::task_rejected(task.id(), "state is empty"));
        }
        if !self
            .jurisdictions
            .contains(&task.jurisdiction().to_uppercase())
        {
            return Err(PollerError::task_rejected(
                task.id(),
                format!("unknown jurisdiction {:?}", task.jurisdiction()),
            ));
        }
        if !self.case_types.contains(task.case_type_id()) {
            return Err(PollerError::task_rejected(
                task.id(),
                format!("case type {:?} is not polled", task.case_type_id()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManualTaskEnqueuer {
    admission: TaskAdmission,
    publisher: TaskPublisher,
}

impl ManualTaskEnqueuer {
    pub fn new(admission: TaskAdmission, publisher: TaskPublisher) -> Self {
        Self {
            admission,
            publisher,
        }
    }

    pub async fn enqueue(&self, task: &Task) -> PollerResult<()> {
        if let Err(e) = self.admission.check(task) {
            warn!(task_id = %task.id(), error = %e, "📤 PUBLISHER: Rejected manual task");
            return Err(e);
        }

        self.publisher.publish(std::slice::from_ref(task)).await?;
        info!(
            task_id = %task.id(),
            queue = %self.publisher.queue_name(),
            "📤 PUBLISHER: Manual task queued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CaseCategory;
    use crate::messaging::InMemoryTransport;
    use crate::models::LAST_MODIFIED_FORMAT;
    use chrono::{NaiveDateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn task(jurisdiction: &str, case_type_id: &str) -> Task {
        let modified = NaiveDateTime::parse_from_str("2019-09-25T12:10:00", LAST_MODIFIED_FORMAT).unwrap();
        Task::new("1569408870830254", "Submitted", jurisdiction, case_type_id, modified)
    }

    fn admission() -> TaskAdmission {
        TaskAdmission::new(["DIVORCE", "PROBATE", "CMC"], ["DIVORCE", "GrantOfRepresentation"])
    }

    fn enqueuer(transport: &InMemoryTransport) -> ManualTaskEnqueuer {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2019, 9, 25, 12, 35, 0).unwrap());
        ManualTaskEnqueuer::new(
            admission(),
            TaskPublisher::new(
                Arc::new(transport.clone()),
                "case_tasks",
                chrono::Duration::days(7),
                Arc::new(clock),
            ),
        )
    }

    #[test]
    fn jurisdictions_compare_case_insensitively() {
        let admission = admission();
        assert!(admission.check(&task("divorce", "DIVORCE")).is_ok());
        assert!(admission.check(&task("Probate", "GrantOfRepresentation")).is_ok());
        assert!(admission.check(&task("PROBATE", "DIVORCE")).is_ok());

        let err = admission.check(&task("something", "DIVORCE")).unwrap_err();
        assert!(matches!(err, PollerError::TaskRejected { .. }));
        assert!(err.to_string().contains("unknown jurisdiction"));
    }

    #[test]
    fn case_type_must_be_polled() {
        let err = admission().check(&task("DIVORCE", "Caveat")).unwrap_err();
        assert!(err.to_string().contains("not polled"));
    }

    #[test]
    fn blank_identity_is_rejected() {
        let modified = NaiveDateTime::parse_from_str("2019-09-25T12:10:00", LAST_MODIFIED_FORMAT).unwrap();
        let blank_id = Task::new(" ", "Submitted", "DIVORCE", "DIVORCE", modified);
        let blank_state = Task::new("1", "", "DIVORCE", "DIVORCE", modified);
        assert!(admission().check(&blank_id).is_err());
        assert!(admission().check(&blank_state).is_err());
    }

    #[test]
    fn admission_follows_configuration() {
        let mut config = PollerConfig::default();
        config.notification.jurisdictions = vec!["cmc".to_string()];
        config.case_source.categories = vec![CaseCategory::new("MoneyClaimCase")];

        let admission = TaskAdmission::from_config(&config);
        assert!(admission.check(&task("CMC", "MoneyClaimCase")).is_ok());
        assert!(admission.check(&task("DIVORCE", "MoneyClaimCase")).is_err());
    }

    #[tokio::test]
    async fn accepted_task_is_published() {
        let transport = InMemoryTransport::new();
        enqueuer(&transport)
            .enqueue(&task("divorce", "DIVORCE"))
            .await
            .unwrap();

        let queued = transport.messages("case_tasks");
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_task());
        assert_eq!(queued[0].message_id, "1569408870830254");
    }

    #[tokio::test]
    async fn rejected_task_never_reaches_the_queue() {
        let transport = InMemoryTransport::new();
        let err = enqueuer(&transport)
            .enqueue(&task("something", "DIVORCE"))
            .await
            .unwrap_err();

        assert!(matches!(err, PollerError::TaskRejected { .. }));
        assert!(transport.is_empty("case_tasks"));
    }

    #[tokio::test]
    async fn queue_failure_is_a_publish_error() {
        let transport = InMemoryTransport::new();
        transport.fail_sends_to("case_tasks");
        let err = enqueuer(&transport)
            .enqueue(&task("DIVORCE", "DIVORCE"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(crate::error::PipelineStage::Publish));
    }
}
