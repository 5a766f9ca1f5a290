//! # Idle Watchdog
//!
//! Supervises one consumer session. Every `idle_timeout` (first check one period after
//! arming) it compares the session's last activity and the hard deadline against the
//! clock. On the first check that finds either exceeded, or when the cycle's
//! cancellation token fires, it runs the session's shutdown action once, resolves its
//! completion signal and exits.
//!
//! ```text
//! armed ──tick──▶ check ──fresh──▶ (wait one period) ──▶ check ...
//!                   │
//!                   └─ idle / past deadline / cancelled ──▶ on_expire().await ──▶ resolved
//! ```
//!
//! A disarmed watchdog (the session shut down for some other reason) exits without
//! running the action.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::metrics;

/// Reports the last time the supervised session did anything
pub type ActivityProbe = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shutdown action run when the watchdog fires
pub type ExpireAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

const MIN_CHECK_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryReason {
    IdleTimeout,
    HardDeadline,
    Cancelled,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::IdleTimeout => "idle_timeout",
            ExpiryReason::HardDeadline => "hard_deadline",
            ExpiryReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot signal resolved when a session (or its watchdog) has fully stopped
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    token: CancellationToken,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already resolved
    pub fn resolved() -> Self {
        let signal = Self::new();
        signal.resolve();
        signal
    }

    pub(crate) fn resolve(&self) {
        self.token.cancel();
    }

    pub fn is_resolved(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Decide whether a session has expired.
///
/// The hard deadline wins when both conditions hold.
pub fn evaluate(
    now: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    idle_timeout: chrono::Duration,
    hard_deadline: DateTime<Utc>,
) -> Option<ExpiryReason> {
    if now > hard_deadline {
        Some(ExpiryReason::HardDeadline)
    } else if now > last_activity + idle_timeout {
        Some(ExpiryReason::IdleTimeout)
    } else {
        None
    }
}

/// Arms watchdogs that share a clock, an idle timeout and a cancellation scope
#[derive(Debug, Clone)]
pub struct WatchdogFactory {
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl WatchdogFactory {
    pub fn new(clock: Arc<dyn Clock>, idle_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            clock,
            idle_timeout: idle_timeout.max(MIN_CHECK_PERIOD),
            cancel,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn supervise(
        &self,
        name: impl Into<String>,
        probe: ActivityProbe,
        hard_deadline: DateTime<Utc>,
        on_expire: ExpireAction,
    ) -> WatchdogHandle {
        let name = name.into();
        let cancel = self.cancel.child_token();
        let disarm = CancellationToken::new();
        let completion = CompletionSignal::new();
        let reason = Arc::new(OnceLock::new());

        let period = self.idle_timeout;
        let idle_timeout =
            chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let clock = Arc::clone(&self.clock);

        let task = tokio::spawn({
            let name = name.clone();
            let cancel = cancel.clone();
            let disarm = disarm.clone();
            let completion = completion.clone();
            let reason_slot = Arc::clone(&reason);
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                let fired = loop {
                    tokio::select! {
                        biased;
                        _ = disarm.cancelled() => break None,
                        _ = cancel.cancelled() => break Some(ExpiryReason::Cancelled),
                        _ = ticker.tick() => {
                            let now = clock.now();
                            let last_activity = probe();
                            if let Some(reason) = evaluate(now, last_activity, idle_timeout, hard_deadline) {
                                break Some(reason);
                            }
                            debug!(
                                watchdog = %name,
                                last_activity = %last_activity,
                                "⏱️ WATCHDOG: Session still active"
                            );
                        }
                    }
                };

                match fired {
                    Some(reason) => {
                        info!(
                            watchdog = %name,
                            reason = %reason,
                            "⏰ WATCHDOG: Session expired, shutting it down"
                        );
                        metrics::watchdog_expiries_total()
                            .add(1, &[KeyValue::new("reason", reason.as_str())]);
                        let _ = reason_slot.set(reason);
                        on_expire().await;
                    }
                    None => debug!(watchdog = %name, "⏱️ WATCHDOG: Disarmed"),
                }

                completion.resolve();
            }
        });

        WatchdogHandle {
            name,
            completion,
            reason,
            cancel,
            disarm,
            task,
        }
    }
}

#[derive(Debug)]
pub struct WatchdogHandle {
    name: String,
    completion: CompletionSignal,
    reason: Arc<OnceLock<ExpiryReason>>,
    cancel: CancellationToken,
    disarm: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved after the shutdown action has finished, or after disarming
    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    /// Why the watchdog fired, once it has
    pub fn reason(&self) -> Option<ExpiryReason> {
        self.reason.get().copied()
    }

    /// Fire now, running the shutdown action
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop checking without running the shutdown action
    pub fn disarm(&self) {
        self.disarm.cancel();
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 9, 25, 12, 35, 0).unwrap()
    }

    fn counting_action(counter: &Arc<AtomicUsize>) -> ExpireAction {
        let counter = Arc::clone(counter);
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn evaluate_prefers_deadline() {
        let t = start();
        let idle = chrono::Duration::seconds(30);
        assert_eq!(evaluate(t, t, idle, t + idle), None);
        assert_eq!(evaluate(t + idle, t, idle, t + idle * 2), None);
        assert_eq!(
            evaluate(t + idle * 2, t, idle, t + idle * 10),
            Some(ExpiryReason::IdleTimeout)
        );
        assert_eq!(
            evaluate(t + idle * 2, t, idle, t + idle),
            Some(ExpiryReason::HardDeadline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_shut_down_once() {
        let clock = Arc::new(TokioClock::starting_at(start()));
        let factory = WatchdogFactory::new(
            clock.clone(),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let began = Instant::now();

        let last_activity = start();
        let handle = factory.supervise(
            "idle",
            Arc::new(move || last_activity),
            start() + chrono::Duration::minutes(20),
            counting_action(&fired),
        );

        handle.completion().wait().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(handle.reason(), Some(ExpiryReason::IdleTimeout));
        assert!(began.elapsed() <= Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_session_is_bounded_by_deadline() {
        let clock = Arc::new(TokioClock::starting_at(start()));
        let factory = WatchdogFactory::new(
            clock.clone(),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let began = Instant::now();

        let probe_clock = clock.clone();
        let handle = factory.supervise(
            "busy",
            Arc::new(move || probe_clock.now()),
            start() + chrono::Duration::minutes(2),
            counting_action(&fired),
        );

        handle.completion().wait().await;
        assert_eq!(handle.reason(), Some(ExpiryReason::HardDeadline));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(began.elapsed() <= Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_runs_the_shutdown_path() {
        let clock = Arc::new(TokioClock::starting_at(start()));
        let cancel = CancellationToken::new();
        let factory = WatchdogFactory::new(clock.clone(), Duration::from_secs(30), cancel.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let probe_clock = clock.clone();
        let handle = factory.supervise(
            "cancelled",
            Arc::new(move || probe_clock.now()),
            start() + chrono::Duration::minutes(20),
            counting_action(&fired),
        );

        cancel.cancel();
        handle.completion().wait().await;
        assert_eq!(handle.reason(), Some(ExpiryReason::Cancelled));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_watchdog_skips_the_action() {
        let clock = Arc::new(TokioClock::starting_at(start()));
        let factory = WatchdogFactory::new(
            clock.clone(),
            Duration::from_secs(30),
            CancellationToken::new(),
        );
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = factory.supervise(
            "disarmed",
            Arc::new(start),
            start() + chrono::Duration::minutes(20),
            counting_action(&fired),
        );

        handle.disarm();
        handle.completion().wait().await;
        assert_eq!(handle.reason(), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resolved_signal_reports_resolved() {
        assert!(CompletionSignal::resolved().is_resolved());
        assert!(!CompletionSignal::new().is_resolved());
    }
}
