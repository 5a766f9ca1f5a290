//! What a poll cycle did, for logs and for the `poll-once` command.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::consumer::{ExpiryReason, SessionKind, SessionStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The window was still closed
    Skipped { minutes_since_last: i64 },
    Complete,
    /// Tasks were published but a session did not run cleanly
    Partial { reasons: Vec<String> },
    /// The pipeline failed and the window went back to its previous start
    RolledBack { reason: String },
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped { .. } => "skipped",
            CycleOutcome::Complete => "complete",
            CycleOutcome::Partial { .. } => "partial",
            CycleOutcome::RolledBack { .. } => "rolled_back",
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CycleOutcome::Skipped { .. })
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, CycleOutcome::RolledBack { .. })
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Ran and was shut down, normally by its watchdog
    Completed,
    Failed { error: String },
    /// Never started because the cycle was cancelled first
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub expiry_reason: Option<ExpiryReason>,
}

impl SessionReport {
    pub fn not_started(kind: SessionKind) -> Self {
        Self {
            kind,
            status: SessionStatus::NotStarted,
            stats: SessionStats::default(),
            expiry_reason: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// Counts from the fetch/transform/publish side of the cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Cases reported by the source, per case type
    pub cases_by_category: BTreeMap<String, u64>,
    pub discarded: usize,
    pub tasks_published: usize,
}

impl PipelineReport {
    pub fn cases_found(&self) -> u64 {
        self.cases_by_category.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub outcome: CycleOutcome,
    /// Window start before this cycle
    pub window_start: Option<DateTime<Utc>>,
    /// Window start after this cycle; unchanged on skip and rollback
    pub window_end: Option<DateTime<Utc>>,
    pub pipeline: PipelineReport,
    pub sessions: Vec<SessionReport>,
}

impl CycleReport {
    pub fn skipped(cycle_id: Uuid, minutes_since_last: i64) -> Self {
        Self {
            cycle_id,
            outcome: CycleOutcome::Skipped { minutes_since_last },
            window_start: None,
            window_end: None,
            pipeline: PipelineReport::default(),
            sessions: Vec::new(),
        }
    }

    pub fn session(&self, kind: SessionKind) -> Option<&SessionReport> {
        self.sessions.iter().find(|s| s.kind == kind)
    }

    /// One line for the operator
    pub fn summary(&self) -> String {
        match &self.outcome {
            CycleOutcome::Skipped { minutes_since_last } => format!(
                "cycle {} skipped: last run was {} minutes ago",
                self.cycle_id, minutes_since_last
            ),
            CycleOutcome::RolledBack { reason } => format!(
                "cycle {} rolled back to {}: {}",
                self.cycle_id,
                format_time(self.window_start),
                reason
            ),
            outcome => {
                let mut line = format!(
                    "cycle {} {}: window {} .. {}, {} cases found, {} discarded, {} tasks published",
                    self.cycle_id,
                    outcome,
                    format_time(self.window_start),
                    format_time(self.window_end),
                    self.pipeline.cases_found(),
                    self.pipeline.discarded,
                    self.pipeline.tasks_published,
                );
                for session in &self.sessions {
                    line.push_str(&format!(
                        ", {} {} ({} processed, {} failed)",
                        session.kind,
                        session_status(session),
                        session.stats.processed,
                        session.stats.failed
                    ));
                }
                line
            }
        }
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

fn session_status(session: &SessionReport) -> String {
    match (&session.status, session.expiry_reason) {
        (SessionStatus::Completed, Some(reason)) => reason.to_string(),
        (SessionStatus::Completed, None) => "completed".to_string(),
        (SessionStatus::Failed { error }, _) => format!("failed: {error}"),
        (SessionStatus::NotStarted, _) => "not started".to_string(),
    }
}
