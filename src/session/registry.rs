//! Process-wide session registry and reaper.
//!
//! The registry maps session ids to live sessions and evicts idle ones. A
//! session's allowed idle age grows with its hit count, so active users keep
//! their state while drive-by visitors are collected quickly. Sweeps are
//! coalesced: no matter how many requests arrive, at most one scan runs per
//! sweep interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::{random_id, ReapParams, Session};

/// Idle age in seconds at which a session with `hits` requests expires.
pub fn reap_age(hits: u64, reap: &ReapParams) -> i64 {
    let extra = reap
        .inc_seconds
        .saturating_mul(hits.saturating_sub(1) as i64);
    reap.min_seconds.saturating_add(extra).min(reap.max_seconds)
}

// ============================================================================
// SessionRegistry
// ============================================================================

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    reap: ReapParams,
    sweep_interval: Duration,
    /// Unix millis of the last sweep; gates coalescing.
    last_sweep_ms: AtomicI64,
}

impl SessionRegistry {
    pub fn new(reap: ReapParams, sweep_interval: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            reap,
            sweep_interval,
            last_sweep_ms: AtomicI64::new(0),
        }
    }

    /// Create a fresh session under a new random id.
    pub fn create(&self) -> Arc<Session> {
        loop {
            let id = random_id();
            match self.sessions.entry(id.clone()) {
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let session = Arc::new(Session::new(id, self.reap));
                    entry.insert(Arc::clone(&session));
                    debug!(session_id = session.id(), "created session");
                    return session;
                }
                // 128-bit collision; mint another id.
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ------------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------------

    /// Destroy a session, waiting out any requests still using it.
    ///
    /// The session lock is taken first so no request is mid-flight, then the
    /// queue is checked: if other tasks are already waiting for the lock the
    /// kill backs off and retries, because removing the session under them
    /// would hand them state scheduled for destruction. Once removed, the
    /// session and everything it owns is dropped when the last `Arc` goes.
    pub async fn kill(&self, id: &str) -> bool {
        loop {
            let session = match self.lookup(id) {
                Some(session) => session,
                None => return false,
            };

            let guard = session.lock().await;
            if session.queued() > 0 {
                drop(guard);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            self.sessions.remove(id);
            drop(guard);
            debug!(session_id = id, "killed session");
            return true;
        }
    }

    /// Evict expired sessions. Returns how many were killed.
    ///
    /// Callers may invoke this on every request; a scan actually runs only if
    /// the sweep interval has elapsed since the previous one, and concurrent
    /// callers race on a single compare-exchange so exactly one of them scans.
    pub async fn sweep(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::SeqCst);
        if now_ms - last < self.sweep_interval.as_millis() as i64 {
            return 0;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                let idle = (now - session.last_access()).num_seconds();
                idle > reap_age(session.hits(), session.reap())
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut killed = 0;
        for id in expired {
            if self.kill(&id).await {
                killed += 1;
            }
        }
        if killed > 0 {
            info!(evicted = killed, remaining = self.len(), "session sweep");
        }
        killed
    }
}

// ============================================================================
// Background Sweeper
// ============================================================================

/// Spawn the periodic sweep task. The interval matches the coalescing window,
/// so idle sessions are collected even when no requests arrive to trigger
/// sweeps.
pub fn spawn_sweeper(registry: Arc<SessionRegistry>) -> JoinHandle<()> {
    // A zero interval is valid for on-demand sweeps but not for a ticker.
    let period = registry.sweep_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep().await;
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_registry() -> SessionRegistry {
        SessionRegistry::new(ReapParams::default(), Duration::from_millis(0))
    }

    #[test]
    fn reap_age_grows_with_hits() {
        let reap = ReapParams::default();
        assert_eq!(reap_age(1, &reap), 600);
        assert_eq!(reap_age(2, &reap), 1200);
        assert_eq!(reap_age(5, &reap), 3000);
        // Saturates at the ceiling.
        assert_eq!(reap_age(6, &reap), 3600);
        assert_eq!(reap_age(10_000, &reap), 3600);
    }

    #[test]
    fn reap_age_with_custom_params() {
        let reap = ReapParams {
            min_seconds: 10,
            max_seconds: 25,
            inc_seconds: 5,
        };
        assert_eq!(reap_age(1, &reap), 10);
        assert_eq!(reap_age(3, &reap), 20);
        assert_eq!(reap_age(4, &reap), 25);
        assert_eq!(reap_age(5, &reap), 25);
    }

    #[test]
    fn create_and_lookup() {
        let registry = fast_registry();
        let session = registry.create();

        assert_eq!(registry.len(), 1);
        let found = registry.lookup(session.id()).unwrap();
        assert_eq!(found.id(), session.id());
        assert!(registry.lookup("0".repeat(32).as_str()).is_none());
    }

    #[tokio::test]
    async fn kill_removes_idle_session() {
        let registry = fast_registry();
        let session = registry.create();
        let id = session.id().to_string();
        drop(session);

        assert!(registry.kill(&id).await);
        assert!(registry.lookup(&id).is_none());
        assert!(!registry.kill(&id).await);
    }

    #[tokio::test]
    async fn kill_waits_for_queued_requests() {
        let registry = Arc::new(fast_registry());
        let session = registry.create();
        let id = session.id().to_string();

        // A request holds the lock and another is queued behind it.
        let holder = session.lock().await;
        let queued = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let mut guard = session.lock().await;
                guard.user_id = 99;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let killer = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.kill(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The kill must not have removed the session out from under the
        // queued request.
        assert!(registry.lookup(&id).is_some());

        drop(holder);
        queued.await.unwrap();
        assert!(killer.await.unwrap());
        assert!(registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_sessions() {
        let registry = SessionRegistry::new(
            ReapParams {
                min_seconds: 600,
                max_seconds: 3600,
                inc_seconds: 600,
            },
            Duration::from_millis(0),
        );

        let stale = registry.create();
        stale.backdate(700);
        let fresh = registry.create();

        assert_eq!(registry.sweep().await, 1);
        assert!(registry.lookup(stale.id()).is_none());
        assert!(registry.lookup(fresh.id()).is_some());
    }

    #[tokio::test]
    async fn sweep_respects_hit_earned_age() {
        let registry = SessionRegistry::new(ReapParams::default(), Duration::from_millis(0));

        // Two hits buy 1200s of idle age; 700s idle is not enough to evict.
        let session = registry.create();
        session.record_hit();
        session.backdate(700);

        assert_eq!(registry.sweep().await, 0);
        assert!(registry.lookup(session.id()).is_some());

        session.backdate(1300);
        assert_eq!(registry.sweep().await, 1);
    }

    #[tokio::test]
    async fn sweeps_are_coalesced() {
        let registry = SessionRegistry::new(ReapParams::default(), Duration::from_secs(3600));
        let session = registry.create();
        session.backdate(10_000);

        // First sweep within the interval runs (last sweep is the epoch),
        // the second is suppressed even though a session is expired.
        assert_eq!(registry.sweep().await, 1);
        let other = registry.create();
        other.backdate(10_000);
        assert_eq!(registry.sweep().await, 0);
        assert!(registry.lookup(other.id()).is_some());
    }
}
