//! # Notification
//!
//! Where consumed tasks end up. The sink receives each task together with the deep-link
//! base URL of the case viewer.

use async_trait::async_trait;
use tracing::info;

use crate::error::PollerResult;
use crate::models::Task;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, task: &Task, deep_link_base_url: &str) -> PollerResult<()>;
}

/// Link to the case in the case viewer: `{base}{jurisdiction}/{case_type_id}/{id}`
pub fn deep_link(base_url: &str, task: &Task) -> String {
    format!(
        "{}{}/{}/{}",
        base_url,
        task.jurisdiction(),
        task.case_type_id(),
        task.id()
    )
}

/// Sink that records each delivery in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn deliver(&self, task: &Task, deep_link_base_url: &str) -> PollerResult<()> {
        info!(
            task_id = %task.id(),
            state = %task.state(),
            jurisdiction = %task.jurisdiction(),
            case_type_id = %task.case_type_id(),
            link = %deep_link(deep_link_base_url, task),
            "📧 NOTIFY: Task delivered"
        );
        Ok(())
    }
}
