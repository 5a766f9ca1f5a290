//! # Poller Metrics
//!
//! OpenTelemetry counters for the poll cycle. Instruments are created against the
//! global meter provider; exporting is left to whatever provider the host process
//! installs (none by default, in which case recording is a no-op).
//!
//! ```rust
//! use case_poller::metrics;
//! use opentelemetry::KeyValue;
//!
//! metrics::cycles_total().add(1, &[KeyValue::new("outcome", "complete")]);
//! ```

use opentelemetry::metrics::{Counter, Meter};
use std::sync::OnceLock;

static POLLER_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    POLLER_METER.get_or_init(|| opentelemetry::global::meter("case-poller"))
}

/// Poll cycles attempted
///
/// Labels:
/// - outcome: skipped, complete, partial, rolled_back, window_error
pub fn cycles_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.cycles.total")
        .with_description("Total number of poll cycles attempted")
        .build()
}

/// Cases reported by the case source
///
/// Labels:
/// - case_type_id
pub fn cases_found_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.cases.found.total")
        .with_description("Total number of cases returned by the case source")
        .build()
}

/// Records dropped because they could not be turned into tasks
///
/// Labels:
/// - case_type_id
pub fn records_discarded_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.records.discarded.total")
        .with_description("Total number of case records discarded during transformation")
        .build()
}

pub fn tasks_published_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.tasks.published.total")
        .with_description("Total number of tasks placed on the queue")
        .build()
}

/// Messages handled by consumer sessions
///
/// Labels:
/// - session: dead_letter_drain, live_consume
/// - result: processed, ignored, failed
pub fn session_messages_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.session.messages.total")
        .with_description("Total number of messages handled by consumer sessions")
        .build()
}

/// Watchdog expiries
///
/// Labels:
/// - reason: idle_timeout, hard_deadline, cancelled
pub fn watchdog_expiries_total() -> Counter<u64> {
    meter()
        .u64_counter("poller.watchdog.expiries.total")
        .with_description("Total number of consumer sessions shut down by their watchdog")
        .build()
}
