use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{decide, RunWindowStore, WindowDecision, WindowReservation};
use crate::error::PollerResult;

/// Run window held in process memory.
///
/// The mutex is held across the whole read-modify-write of `try_advance`, which is what
/// the row lock does for the PostgreSQL store. An optional latency inside the critical
/// section widens the race window for contention tests.
#[derive(Debug, Default)]
pub struct InMemoryRunWindowStore {
    row: Mutex<Option<DateTime<Utc>>>,
    lock_latency: Option<Duration>,
}

impl InMemoryRunWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_run(last_run: DateTime<Utc>) -> Self {
        Self {
            row: Mutex::new(Some(last_run)),
            lock_latency: None,
        }
    }

    /// Sleep for `latency` while holding the lock in `try_advance`
    pub fn with_lock_latency(mut self, latency: Duration) -> Self {
        self.lock_latency = Some(latency);
        self
    }
}

#[async_trait]
impl RunWindowStore for InMemoryRunWindowStore {
    async fn try_advance(
        &self,
        now: DateTime<Utc>,
        min_interval_minutes: i64,
        default_last_run: DateTime<Utc>,
    ) -> PollerResult<WindowDecision> {
        let mut row = self.row.lock().await;
        let previous = *row.get_or_insert(default_last_run);

        if let Some(latency) = self.lock_latency {
            tokio::time::sleep(latency).await;
        }

        let decision = decide(previous, now, min_interval_minutes);
        if let WindowDecision::Proceed(reservation) = &decision {
            *row = Some(reservation.advanced_to);
        }
        Ok(decision)
    }

    async fn insert_if_absent(&self, default_last_run: DateTime<Utc>) -> PollerResult<bool> {
        let mut row = self.row.lock().await;
        if row.is_some() {
            return Ok(false);
        }
        *row = Some(default_last_run);
        Ok(true)
    }

    async fn revert(&self, reservation: &WindowReservation) -> PollerResult<bool> {
        let mut row = self.row.lock().await;
        if *row == Some(reservation.advanced_to) {
            *row = Some(reservation.previous);
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_last_run(&self, last_run: DateTime<Utc>) -> PollerResult<()> {
        *self.row.lock().await = Some(last_run);
        Ok(())
    }

    async fn last_run(&self) -> PollerResult<Option<DateTime<Utc>>> {
        Ok(*self.row.lock().await)
    }
}
