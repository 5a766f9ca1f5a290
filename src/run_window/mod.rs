//! # Run Window Guard
//!
//! A single persisted timestamp decides whether a poll cycle may start. The guard reads
//! it under an exclusive lock, compares the whole minutes elapsed against the configured
//! minimum interval and, when the window is open, moves it to `now` before releasing the
//! lock. Two overlapping attempts therefore cannot both proceed.
//!
//! The advance is tentative: a cycle whose pipeline fails hands its
//! [`WindowReservation`] back to [`RunWindowGuard::rollback`], which restores the previous
//! value only if nobody has moved the window since.
//!
//! ## Backends
//!
//! - [`PgRunWindowStore`] - `last_run_time` row locked with `SELECT ... FOR UPDATE`
//! - [`InMemoryRunWindowStore`] - async mutex held across the read-modify-write

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::PollerResult;

pub use memory::InMemoryRunWindowStore;
pub use postgres::PgRunWindowStore;

/// A successful advance: the window moved from `previous` to `advanced_to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReservation {
    pub previous: DateTime<Utc>,
    pub advanced_to: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    Proceed(WindowReservation),
    TooSoon { minutes_since_last: i64 },
}

impl WindowDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, WindowDecision::Proceed(_))
    }
}

/// Compare the stored window start with `now`.
///
/// Elapsed time is truncated to whole minutes before the comparison, so 29m59s against
/// a 30 minute interval is still too soon.
pub fn decide(previous: DateTime<Utc>, now: DateTime<Utc>, min_interval_minutes: i64) -> WindowDecision {
    let minutes_since_last = (now - previous).num_minutes();
    if minutes_since_last < min_interval_minutes {
        WindowDecision::TooSoon { minutes_since_last }
    } else {
        WindowDecision::Proceed(WindowReservation {
            previous,
            advanced_to: now,
        })
    }
}

/// Persistence for the singleton run window row
#[async_trait]
pub trait RunWindowStore: Send + Sync {
    /// Lock the row (creating it from `default_last_run` on a miss), decide, and write
    /// `now` when the decision is to proceed, all in one critical section
    async fn try_advance(
        &self,
        now: DateTime<Utc>,
        min_interval_minutes: i64,
        default_last_run: DateTime<Utc>,
    ) -> PollerResult<WindowDecision>;

    /// Create the row unless it exists. Returns whether a row was created.
    async fn insert_if_absent(&self, default_last_run: DateTime<Utc>) -> PollerResult<bool>;

    /// Restore `reservation.previous` if the row still holds `reservation.advanced_to`.
    /// Returns whether the row was changed.
    async fn revert(&self, reservation: &WindowReservation) -> PollerResult<bool>;

    /// Unconditionally set the window start
    async fn set_last_run(&self, last_run: DateTime<Utc>) -> PollerResult<()>;

    async fn last_run(&self) -> PollerResult<Option<DateTime<Utc>>>;
}

pub struct RunWindowGuard {
    store: Arc<dyn RunWindowStore>,
    clock: Arc<dyn Clock>,
    min_interval_minutes: i64,
    lookback_days: i64,
}

impl RunWindowGuard {
    pub fn new(
        store: Arc<dyn RunWindowStore>,
        clock: Arc<dyn Clock>,
        min_interval_minutes: i64,
        lookback_days: i64,
    ) -> Self {
        Self {
            store,
            clock,
            min_interval_minutes,
            lookback_days,
        }
    }

    pub fn min_interval_minutes(&self) -> i64 {
        self.min_interval_minutes
    }

    /// Window start used when no row exists: today's midnight (UTC) minus the look-back
    pub fn default_window_start(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let midnight = now
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        midnight - chrono::Duration::days(self.lookback_days)
    }

    pub async fn try_advance(&self, now: DateTime<Utc>) -> PollerResult<WindowDecision> {
        // The row stores microseconds; keep `advanced_to` comparable with what is read back.
        let now = now.trunc_subsecs(6);
        let decision = self
            .store
            .try_advance(now, self.min_interval_minutes, self.default_window_start())
            .await?;

        match &decision {
            WindowDecision::Proceed(reservation) => info!(
                previous = %reservation.previous,
                advanced_to = %reservation.advanced_to,
                "🪟 WINDOW: Advanced run window"
            ),
            WindowDecision::TooSoon { minutes_since_last } => info!(
                minutes_since_last = minutes_since_last,
                min_interval_minutes = self.min_interval_minutes,
                "🪟 WINDOW: The last run was {} minutes ago",
                minutes_since_last
            ),
        }
        Ok(decision)
    }

    pub async fn insert_if_absent(&self) -> PollerResult<bool> {
        let created = self.store.insert_if_absent(self.default_window_start()).await?;
        if created {
            debug!("🪟 WINDOW: Created run window row");
        }
        Ok(created)
    }

    /// Keep the advance. The new value is already durable; this only records the outcome.
    pub fn commit(&self, reservation: &WindowReservation) {
        debug!(
            advanced_to = %reservation.advanced_to,
            "🪟 WINDOW: Keeping run window advance"
        );
    }

    /// Undo the advance unless a later cycle has already moved the window
    pub async fn rollback(&self, reservation: &WindowReservation) -> PollerResult<bool> {
        let reverted = self.store.revert(reservation).await?;
        if reverted {
            warn!(
                restored = %reservation.previous,
                discarded = %reservation.advanced_to,
                "🪟 WINDOW: Rolled back run window"
            );
        } else {
            warn!(
                advanced_to = %reservation.advanced_to,
                "🪟 WINDOW: Run window moved since this cycle started; rollback skipped"
            );
        }
        Ok(reverted)
    }

    /// Operator override of the window start
    pub async fn reset_to(&self, last_run: DateTime<Utc>) -> PollerResult<()> {
        let last_run = last_run.trunc_subsecs(6);
        self.store.set_last_run(last_run).await?;
        info!(last_run = %last_run, "🪟 WINDOW: Run window reset");
        Ok(())
    }

    pub async fn last_run(&self) -> PollerResult<Option<DateTime<Utc>>> {
        self.store.last_run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 9, 25, hour, minute, 0).unwrap()
    }

    #[test]
    fn decide_uses_whole_minutes() {
        let previous = at(12, 0);
        let almost = previous + chrono::Duration::seconds(29 * 60 + 59);
        assert_eq!(
            decide(previous, almost, 30),
            WindowDecision::TooSoon {
                minutes_since_last: 29
            }
        );
        assert!(decide(previous, at(12, 30), 30).is_proceed());
    }

    #[test]
    fn default_window_start_is_midnight_minus_lookback() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2019, 9, 25, 12, 35, 17).unwrap());
        let guard = RunWindowGuard::new(
            Arc::new(InMemoryRunWindowStore::new()),
            Arc::new(clock),
            30,
            1,
        );
        assert_eq!(
            guard.default_window_start(),
            Utc.with_ymd_and_hms(2019, 9, 24, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn proceed_then_too_soon() {
        let clock = ManualClock::new(at(12, 35));
        let store = Arc::new(InMemoryRunWindowStore::with_last_run(at(12, 0)));
        let guard = RunWindowGuard::new(store.clone(), Arc::new(clock.clone()), 30, 1);

        let decision = guard.try_advance(at(12, 35)).await.unwrap();
        assert_eq!(
            decision,
            WindowDecision::Proceed(WindowReservation {
                previous: at(12, 0),
                advanced_to: at(12, 35),
            })
        );

        let decision = guard.try_advance(at(12, 40)).await.unwrap();
        assert_eq!(decision, WindowDecision::TooSoon { minutes_since_last: 5 });
        assert_eq!(guard.last_run().await.unwrap(), Some(at(12, 35)));
    }

    #[tokio::test]
    async fn rollback_only_reverts_own_advance() {
        let clock = ManualClock::new(at(12, 35));
        let store = Arc::new(InMemoryRunWindowStore::with_last_run(at(12, 0)));
        let guard = RunWindowGuard::new(store, Arc::new(clock), 30, 1);

        let WindowDecision::Proceed(reservation) = guard.try_advance(at(12, 35)).await.unwrap()
        else {
            panic!("expected the window to open");
        };

        guard.reset_to(at(13, 0)).await.unwrap();
        assert!(!guard.rollback(&reservation).await.unwrap());
        assert_eq!(guard.last_run().await.unwrap(), Some(at(13, 0)));

        guard.reset_to(at(12, 35)).await.unwrap();
        assert!(guard.rollback(&reservation).await.unwrap());
        assert_eq!(guard.last_run().await.unwrap(), Some(at(12, 0)));
    }

    #[tokio::test]
    async fn first_read_creates_row_from_default() {
        let clock = ManualClock::new(at(12, 35));
        let store = Arc::new(InMemoryRunWindowStore::new());
        let guard = RunWindowGuard::new(store, Arc::new(clock), 30, 1);

        assert!(guard.insert_if_absent().await.unwrap());
        assert!(!guard.insert_if_absent().await.unwrap());
        assert_eq!(
            guard.last_run().await.unwrap(),
            Some(Utc.with_ymd_and_hms(2019, 9, 24, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn sub_microsecond_precision_is_dropped() {
        let clock = ManualClock::new(at(12, 35));
        let store = Arc::new(InMemoryRunWindowStore::with_last_run(at(12, 0)));
        let guard = RunWindowGuard::new(store, Arc::new(clock), 30, 1);

        let now = at(12, 35) + chrono::Duration::nanoseconds(1_234_567);
        let WindowDecision::Proceed(reservation) = guard.try_advance(now).await.unwrap() else {
            panic!("expected the window to open");
        };
        assert_eq!(
            reservation.advanced_to,
            at(12, 35) + chrono::Duration::microseconds(1_234)
        );
    }
}
