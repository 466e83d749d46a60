//! Per-session coordination state.
//!
//! Sessions are independent: each gets its own write lock, extraction
//! watermark and health flags, keyed by the scope's canonical key. The
//! arena holds coordination state only; evicting an idle session never
//! touches stored episodes or facts, and the state is recreated lazily on
//! the next touch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engram_store::Scope;
use tracing::debug;

/// Coordination state for one live session.
pub struct SessionState {
    /// Serializes appends within the session. Extraction never takes this.
    pub write_lock: tokio::sync::Mutex<()>,
    /// Appends since the last scheduled extraction.
    pending_appends: AtomicU64,
    /// At-most-one extraction in flight per session.
    in_flight_extraction: AtomicBool,
    /// Highest episode seq already incorporated into the profile.
    watermark: AtomicU64,
    /// Set while the last extraction batch is parked after exhausted retries.
    degraded: AtomicBool,
    /// Signalled whenever the extraction slot is released.
    slot_released: tokio::sync::Notify,
    last_touched: Mutex<Instant>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            write_lock: tokio::sync::Mutex::new(()),
            pending_appends: AtomicU64::new(0),
            in_flight_extraction: AtomicBool::new(false),
            watermark: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            slot_released: tokio::sync::Notify::new(),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_touched.lock() {
            *at = Instant::now();
        }
    }

    /// Record one append; returns the new pending count.
    pub fn note_append(&self) -> u64 {
        self.pending_appends.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim the extraction slot. Exactly one caller wins until
    /// `finish_extraction` releases it; losers skip scheduling since the
    /// winner reads their episodes anyway.
    pub fn try_begin_extraction(&self) -> bool {
        let won = self
            .in_flight_extraction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.pending_appends.store(0, Ordering::SeqCst);
        }
        won
    }

    /// Release the extraction slot and record the run's outcome.
    pub fn finish_extraction(&self, new_watermark: Option<u64>) {
        match new_watermark {
            Some(seq) => {
                self.watermark.fetch_max(seq, Ordering::SeqCst);
                self.degraded.store(false, Ordering::SeqCst);
            }
            // Parked batch: watermark stays so the next run replays it.
            None => self.degraded.store(true, Ordering::SeqCst),
        }
        self.in_flight_extraction.store(false, Ordering::SeqCst);
        self.slot_released.notify_waiters();
    }

    /// Take the extraction slot, waiting for an in-flight run to release it.
    /// The re-check after registering avoids losing a release that lands
    /// between the failed claim and the wait.
    pub async fn acquire_extraction_slot(&self) {
        loop {
            if self.try_begin_extraction() {
                return;
            }
            let released = self.slot_released.notified();
            if self.try_begin_extraction() {
                return;
            }
            released.await;
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        self.pending_appends.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Reset after a session clear: the tombstoned episodes must not feed
    /// future extraction runs.
    pub fn reset(&self) {
        self.pending_appends.store(0, Ordering::SeqCst);
        self.watermark.store(0, Ordering::SeqCst);
        self.degraded.store(false, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        self.last_touched
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

/// Health snapshot for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHealth {
    pub pending_appends: u64,
    pub watermark: u64,
    pub degraded: bool,
    pub extraction_in_flight: bool,
}

/// Arena of live session states, keyed by `Scope::canonical_key()`.
#[derive(Default)]
pub struct SessionCoordinator {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily create the state for a scope, refreshing its idle
    /// clock.
    pub fn touch(&self, scope: &Scope) -> Arc<SessionState> {
        let key = scope.canonical_key();
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = sessions
            .entry(key)
            .or_insert_with(|| Arc::new(SessionState::new()))
            .clone();
        drop(sessions);
        state.touch();
        state
    }

    /// Snapshot a session's health without creating state for it.
    pub fn session_health(&self, scope: &Scope) -> Option<SessionHealth> {
        let sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.get(&scope.canonical_key()).map(|state| SessionHealth {
            pending_appends: state.pending(),
            watermark: state.watermark(),
            degraded: state.is_degraded(),
            extraction_in_flight: state.in_flight_extraction.load(Ordering::SeqCst),
        })
    }

    /// Drop coordination state for sessions idle longer than `timeout`.
    /// Sessions with an extraction in flight are kept. Returns how many
    /// were evicted.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = sessions.len();
        sessions.retain(|_, state| {
            state.in_flight_extraction.load(Ordering::SeqCst) || state.idle_for() < timeout
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, live = sessions.len(), "idle sessions evicted");
        }
        evicted
    }

    pub fn live_sessions(&self) -> usize {
        match self.sessions.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(session: &str) -> Scope {
        Scope::new("acme", "assistant", "alice", session)
    }

    #[test]
    fn test_same_session_shares_state() {
        let coordinator = SessionCoordinator::new();
        let a = coordinator.touch(&scope("s1"));
        let b = coordinator.touch(&scope("s1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(coordinator.live_sessions(), 1);
    }

    #[test]
    fn test_distinct_sessions_are_isolated() {
        let coordinator = SessionCoordinator::new();
        let a = coordinator.touch(&scope("s1"));
        let b = coordinator.touch(&scope("s2"));
        assert!(!Arc::ptr_eq(&a, &b));
        a.note_append();
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn test_extraction_slot_is_exclusive() {
        let state = SessionState::new();
        assert!(state.try_begin_extraction());
        assert!(!state.try_begin_extraction());
        state.finish_extraction(Some(5));
        assert!(state.try_begin_extraction());
        assert_eq!(state.watermark(), 5);
    }

    #[test]
    fn test_parked_batch_marks_degraded_and_keeps_watermark() {
        let state = SessionState::new();
        assert!(state.try_begin_extraction());
        state.finish_extraction(Some(3));
        assert!(state.try_begin_extraction());
        state.finish_extraction(None);
        assert!(state.is_degraded());
        assert_eq!(state.watermark(), 3);

        assert!(state.try_begin_extraction());
        state.finish_extraction(Some(7));
        assert!(!state.is_degraded(), "success clears the degraded flag");
        assert_eq!(state.watermark(), 7);
    }

    #[test]
    fn test_begin_extraction_resets_pending() {
        let state = SessionState::new();
        state.note_append();
        state.note_append();
        assert_eq!(state.pending(), 2);
        assert!(state.try_begin_extraction());
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn test_evict_idle_drops_only_idle_sessions() {
        let coordinator = SessionCoordinator::new();
        coordinator.touch(&scope("s1"));
        // Nothing is older than an hour.
        assert_eq!(coordinator.evict_idle(Duration::from_secs(3600)), 0);
        // Everything is older than zero.
        assert_eq!(coordinator.evict_idle(Duration::ZERO), 1);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    #[test]
    fn test_evict_keeps_in_flight_extraction() {
        let coordinator = SessionCoordinator::new();
        let state = coordinator.touch(&scope("s1"));
        assert!(state.try_begin_extraction());
        assert_eq!(coordinator.evict_idle(Duration::ZERO), 0);
        state.finish_extraction(Some(1));
        assert_eq!(coordinator.evict_idle(Duration::ZERO), 1);
    }

    #[test]
    fn test_state_recreated_after_eviction() {
        let coordinator = SessionCoordinator::new();
        let state = coordinator.touch(&scope("s1"));
        assert!(state.try_begin_extraction());
        state.finish_extraction(Some(9));
        coordinator.evict_idle(Duration::ZERO);

        let fresh = coordinator.touch(&scope("s1"));
        assert_eq!(fresh.watermark(), 0, "evicted state starts over");
    }

    #[tokio::test]
    async fn test_acquire_waits_for_slot_release() {
        let state = Arc::new(SessionState::new());
        assert!(state.try_begin_extraction());

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state.acquire_extraction_slot().await;
                state.finish_extraction(Some(2));
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "slot is held, acquire must wait");

        state.finish_extraction(Some(1));
        waiter.await.unwrap();
        assert_eq!(state.watermark(), 2);
    }

    #[test]
    fn test_health_does_not_create_state() {
        let coordinator = SessionCoordinator::new();
        assert!(coordinator.session_health(&scope("s1")).is_none());
        coordinator.touch(&scope("s1"));
        let health = coordinator.session_health(&scope("s1"));
        assert_eq!(
            health,
            Some(SessionHealth {
                pending_appends: 0,
                watermark: 0,
                degraded: false,
                extraction_in_flight: false,
            })
        );
    }
}
