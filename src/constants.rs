//! Shared constants for the queue envelope and the persisted run window.

/// Label carried by every task envelope
pub const TASK_LABEL: &str = "Task";

/// Content type carried by every task envelope
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Suffix appended to a queue name to form its dead-letter queue
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// Primary key of the singleton run window row
pub const RUN_WINDOW_ROW_ID: i32 = 1;

/// Environment variable that selects the configuration overlay and default log level
pub const ENVIRONMENT_VAR: &str = "POLLER_ENV";

/// Prefix for configuration overrides taken from the process environment
pub const CONFIG_ENV_PREFIX: &str = "POLLER";

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}
