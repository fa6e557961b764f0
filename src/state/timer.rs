//! Local stage timers reconciled against authoritative step updates.
//!
//! The backend only reports elapsed/remaining seconds when a step changes.
//! Between updates each [`Timer`] extrapolates from the instant it was told
//! about, and a [`Ticker`] republishes the countdown once per second.

use std::{
    collections::HashMap,
    future::Future,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::debug;

use crate::state::store::StepUpdate;

/// Countdown published to timer observers. All values are whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// Whether the step has started counting.
    pub started: bool,
    /// Whether the step has run out or been cleared.
    pub ended: bool,
    /// Seconds elapsed since start.
    pub elapsed: u64,
    /// Seconds left before the end.
    pub remaining: u64,
    /// Total length of the step.
    pub duration: u64,
}

/// Timer mirroring one step.
#[derive(Debug)]
pub struct Timer {
    id: String,
    running: bool,
    cleared: bool,
    start_at: Instant,
    end_at: Instant,
    tx: watch::Sender<Option<Tick>>,
}

impl Timer {
    fn idle(id: String, now: Instant) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            id,
            running: false,
            cleared: false,
            start_at: now,
            end_at: now,
            tx,
        }
    }

    /// Identifier of the step this timer mirrors.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the step is counting down and has not been cleared.
    pub fn is_running(&self) -> bool {
        self.running && !self.cleared
    }

    /// Reconcile with an authoritative step update received at `now`.
    pub fn update(&mut self, update: &StepUpdate, now: Instant) {
        let step = &update.step;
        self.cleared = false;
        match (step.running && !update.removed, step.elapsed, step.remaining) {
            (true, Some(elapsed), Some(remaining)) if elapsed >= 0 && remaining >= 0 => {
                self.running = true;
                self.start_at = now
                    .checked_sub(Duration::from_secs(elapsed.unsigned_abs()))
                    .unwrap_or(now);
                self.end_at = now + Duration::from_secs(remaining.unsigned_abs());
            }
            (true, _, Some(remaining)) if remaining < 0 => {
                self.running = true;
                self.end_at = now;
            }
            _ => {
                debug!(step_id = %self.id, running = step.running, "timer idle");
                self.running = false;
            }
        }
        self.tx.send_replace(self.current(now));
    }

    /// Countdown at `now`, or `None` when the step is not running.
    pub fn current(&self, now: Instant) -> Option<Tick> {
        let duration = self.end_at.saturating_duration_since(self.start_at).as_secs();
        if self.cleared {
            return Some(Tick {
                started: true,
                ended: true,
                elapsed: duration,
                remaining: 0,
                duration,
            });
        }
        if !self.running {
            return None;
        }
        Some(Tick {
            started: now >= self.start_at,
            ended: now >= self.end_at,
            elapsed: now.saturating_duration_since(self.start_at).as_secs(),
            remaining: self.end_at.saturating_duration_since(now).as_secs(),
            duration,
        })
    }

    /// Whether the countdown has run out while still running.
    pub fn has_expired(&self, now: Instant) -> bool {
        self.is_running() && now >= self.end_at
    }

    /// Stop the countdown and report it as ended. Clearing twice is a no-op.
    pub fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;
        self.running = false;
        self.tx.send_replace(self.current(self.end_at));
    }

    /// Observe countdown updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<Tick>> {
        self.tx.subscribe()
    }

    fn publish(&self, now: Instant) {
        if self.is_running() {
            self.tx.send_replace(self.current(now));
        }
    }
}

/// Registry of timers keyed by step id.
#[derive(Debug, Default)]
pub struct Timers {
    timers: HashMap<String, Timer>,
}

impl Timers {
    /// Apply a step update, creating the timer on first sight.
    pub fn apply(&mut self, update: &StepUpdate, now: Instant) {
        if update.removed {
            if let Some(timer) = self.timers.get_mut(&update.step.id) {
                timer.clear();
            }
            return;
        }
        self.timers
            .entry(update.step.id.clone())
            .or_insert_with(|| Timer::idle(update.step.id.clone(), now))
            .update(update, now);
    }

    /// Republish every running countdown at `now`.
    pub fn tick(&self, now: Instant) {
        for timer in self.timers.values() {
            timer.publish(now);
        }
    }

    /// Look up a timer.
    pub fn get(&self, id: &str) -> Option<&Timer> {
        self.timers.get(id)
    }

    /// Clear a timer, if known.
    pub fn clear(&mut self, id: &str) {
        if let Some(timer) = self.timers.get_mut(id) {
            timer.clear();
        }
    }

    /// Drop a timer entirely. Existing observers see the channel close.
    pub fn forget(&mut self, id: &str) {
        self.timers.remove(id);
    }

    /// Number of tracked timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is tracked.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Ids of timers that have run out at `now`.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.timers
            .values()
            .filter(|timer| timer.has_expired(now))
            .map(|timer| timer.id.clone())
            .collect()
    }

    /// Observe a timer, creating an idle placeholder if the step is not known yet.
    pub fn subscribe(&mut self, id: &str) -> watch::Receiver<Option<Tick>> {
        self.timers
            .entry(id.to_owned())
            .or_insert_with(|| Timer::idle(id.to_owned(), Instant::now()))
            .subscribe()
    }
}

/// Background task calling a closure on every whole-period boundary of the wall clock.
pub struct Ticker {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a ticker. The first tick lands on the next multiple of `period` since the epoch.
    pub fn spawn<F, Fut>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(Instant) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(next_aligned(period), period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    at = interval.tick() => on_tick(at.into_std()).await,
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_aligned(period: Duration) -> time::Instant {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let period_ms = period.as_millis().max(1);
    let wait = period_ms - since_epoch % period_ms;
    time::Instant::now() + Duration::from_millis(u64::try_from(wait).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::state::events::StepChange;

    fn running(id: &str, elapsed: i64, remaining: i64) -> StepUpdate {
        StepUpdate {
            step: StepChange {
                id: id.into(),
                running: true,
                elapsed: Some(elapsed),
                remaining: Some(remaining),
            },
            removed: false,
        }
    }

    #[test]
    fn extrapolates_between_updates() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.apply(&running("t1", 2, 8), now);

        let tick = timers
            .get("t1")
            .and_then(|t| t.current(now + Duration::from_millis(3_500)))
            .unwrap();
        assert_eq!(tick.elapsed, 5);
        assert_eq!(tick.remaining, 4);
        assert_eq!(tick.duration, 10);
        assert!(tick.started && !tick.ended);
    }

    #[test]
    fn expiry_is_detected() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.apply(&running("t1", 0, 3), now);

        assert!(timers.expired(now + Duration::from_secs(2)).is_empty());
        assert_eq!(timers.expired(now + Duration::from_secs(3)), vec!["t1".to_string()]);
    }

    #[test]
    fn negative_remaining_counts_as_ended() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.apply(&running("t1", 12, -2), now);

        let tick = timers.get("t1").and_then(|t| t.current(now)).unwrap();
        assert!(tick.ended);
        assert_eq!(tick.remaining, 0);
    }

    #[test]
    fn paused_step_stops_publishing() {
        let now = Instant::now();
        let mut timers = Timers::default();
        let mut rx = timers.subscribe("t1");
        timers.apply(&running("t1", 0, 10), now);
        assert!(rx.borrow_and_update().is_some());

        let paused = StepUpdate {
            step: StepChange {
                id: "t1".into(),
                running: false,
                elapsed: Some(4),
                remaining: None,
            },
            removed: false,
        };
        timers.apply(&paused, now);
        assert!(rx.borrow_and_update().is_none());
        assert!(timers.expired(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn clear_is_idempotent() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.apply(&running("t1", 1, 9), now);
        let mut rx = timers.subscribe("t1");

        timers.clear("t1");
        let first = *rx.borrow_and_update();
        assert_eq!(first.map(|t| (t.remaining, t.ended)), Some((0, true)));

        timers.clear("t1");
        assert!(!rx.has_changed().unwrap());
        assert!(timers.expired(now + Duration::from_secs(60)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_on_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let ticker = Ticker::spawn(Duration::from_secs(1), move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(3_500)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        ticker.shutdown().await;
        let frozen = count.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }
}
