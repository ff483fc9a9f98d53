//! In-memory rate limiting and cooldowns keyed by `(user, action)`.
//!
//! Two policies share one table:
//!
//! - a sliding-window counter ([`RateLimiter::is_limited`]);
//! - a cooldown deadline ([`RateLimiter::set_cooldown`],
//!   [`RateLimiter::try_cooldown`]).
//!
//! Every accessor is O(1) amortised and never awaits. The table is bounded:
//! when it reaches its cap, expired entries are dropped first, then the
//! least recently accessed ones until it is back at 70 % of the cap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default table capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default interval between background sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Builds the conventional `user:action` key.
pub fn key(user: &str, action: &str) -> String {
    format!("{user}:{action}")
}

#[derive(Debug)]
struct Entry {
    hits: VecDeque<Instant>,
    window: Duration,
    cooldown_until: Option<Instant>,
    last_access: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            hits: VecDeque::new(),
            window: Duration::ZERO,
            cooldown_until: None,
            last_access: now,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.hits.front() {
            if now.duration_since(*first) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        let hits_live = self
            .hits
            .back()
            .is_some_and(|last| now.duration_since(*last) < self.window);
        let cooldown_live = self.cooldown_until.is_some_and(|until| until > now);
        !hits_live && !cooldown_live
    }
}

/// Shared rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RateLimiter {
    /// Creates a limiter holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Sliding-window check.
    ///
    /// Returns `true` (limited) without recording when `limit` hits already
    /// fall inside `window`; otherwise records a hit and returns `false`.
    pub fn is_limited(&self, key: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        self.with_entry(key, now, |entry| {
            entry.window = window;
            entry.prune(now);
            if entry.hits.len() as u32 >= limit {
                true
            } else {
                entry.hits.push_back(now);
                false
            }
        })
    }

    /// Starts (or restarts) a cooldown for `key`.
    pub fn set_cooldown(&self, key: &str, duration: Duration) {
        let now = Instant::now();
        self.with_entry(key, now, |entry| {
            entry.cooldown_until = Some(now + duration);
        });
    }

    /// Returns `true` while a cooldown for `key` is running.
    pub fn is_on_cooldown(&self, key: &str) -> bool {
        !self.remaining(key).is_zero()
    }

    /// Time left on the cooldown for `key` (zero when none).
    pub fn remaining(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Duration::ZERO;
        };
        entry.last_access = now;
        entry
            .cooldown_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now))
    }

    /// Atomically starts a cooldown unless one is already running.
    ///
    /// Returns `Ok(())` when the cooldown was started and `Err(remaining)`
    /// when the key is still cooling down.
    pub fn try_cooldown(&self, key: &str, duration: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        self.with_entry(key, now, |entry| match entry.cooldown_until {
            Some(until) if until > now => Err(until - now),
            _ => {
                entry.cooldown_until = Some(now + duration);
                Ok(())
            }
        })
    }

    /// Clears every policy for `key`.
    pub fn reset(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Rate limiter swept");
        }
        removed
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
            trace!("Rate limiter sweeper stopped");
        })
    }

    fn with_entry<R>(&self, key: &str, now: Instant, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            Self::evict(&mut entries, self.capacity, now);
        }
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(now));
        entry.last_access = now;
        f(entry)
    }

    fn evict(entries: &mut HashMap<String, Entry>, capacity: usize, now: Instant) {
        // Room for the entry being inserted.
        let target = (capacity * 7 / 10).saturating_sub(1);
        entries.retain(|_, e| !e.is_expired(now));
        if entries.len() > target {
            let mut by_age: Vec<(Instant, String)> = entries
                .iter()
                .map(|(k, e)| (e.last_access, k.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(at, _)| *at);
            let excess = entries.len() - target;
            for (_, k) in by_age.into_iter().take(excess) {
                entries.remove(&k);
            }
        }
        debug!(remaining = entries.len(), capacity, "Rate limiter evicted entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_limit_boundary() {
        let limiter = RateLimiter::default();
        let k = key("u1", "spam");

        assert!(!limiter.is_limited(&k, 3, WINDOW));
        assert!(!limiter.is_limited(&k, 3, WINDOW));
        // At limit - 1: allowed, then limited.
        assert!(!limiter.is_limited(&k, 3, WINDOW));
        assert!(limiter.is_limited(&k, 3, WINDOW));
        assert!(limiter.is_limited(&k, 3, WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::default();
        let k = key("u1", "spam");

        assert!(!limiter.is_limited(&k, 2, WINDOW));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!limiter.is_limited(&k, 2, WINDOW));
        assert!(limiter.is_limited(&k, 2, WINDOW));

        tokio::time::advance(Duration::from_secs(5)).await;
        // First hit left the window.
        assert!(!limiter.is_limited(&k, 2, WINDOW));
        assert!(limiter.is_limited(&k, 2, WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_calls_are_not_recorded() {
        let limiter = RateLimiter::default();
        let k = key("u1", "spam");
        let mut allowed = 0;
        for _ in 0..20 {
            if !limiter.is_limited(&k, 5, WINDOW) {
                allowed += 1;
            }
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_lifecycle() {
        let limiter = RateLimiter::default();
        let k = key("u1", "ping");

        assert!(!limiter.is_on_cooldown(&k));
        limiter.set_cooldown(&k, Duration::from_secs(3));
        assert!(limiter.is_on_cooldown(&k));
        assert_eq!(limiter.remaining(&k), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.remaining(&k), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!limiter.is_on_cooldown(&k));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_cooldown_is_check_and_set() {
        let limiter = RateLimiter::default();
        let k = key("u1", "ping");

        assert_eq!(limiter.try_cooldown(&k, Duration::from_secs(3)), Ok(()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            limiter.try_cooldown(&k, Duration::from_secs(3)),
            Err(Duration::from_secs(2))
        );
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(limiter.try_cooldown(&k, Duration::from_secs(3)), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_drops_expired_then_oldest() {
        let limiter = RateLimiter::new(10);
        for i in 0..5 {
            limiter.set_cooldown(&format!("short{i}"), Duration::from_secs(1));
        }
        for i in 0..5 {
            limiter.set_cooldown(&format!("long{i}"), Duration::from_secs(600));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        // Expired entries go first; live ones stay.
        limiter.set_cooldown("fresh", Duration::from_secs(600));
        assert_eq!(limiter.len(), 6);
        assert!(limiter.is_on_cooldown("long0"));

        for i in 0..4 {
            limiter.set_cooldown(&format!("more{i}"), Duration::from_secs(600));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(limiter.len(), 10);

        // Nothing expired: evict least recently accessed so that the map,
        // new entry included, sits at 70 %.
        limiter.set_cooldown("overflow", Duration::from_secs(600));
        assert_eq!(limiter.len(), 7);
        assert!(!limiter.is_on_cooldown("long1"));
        assert!(limiter.is_on_cooldown("overflow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired() {
        let limiter = Arc::new(RateLimiter::default());
        limiter.set_cooldown("a", Duration::from_secs(1));
        limiter.set_cooldown("b", Duration::from_secs(600));

        let cancel = CancellationToken::new();
        let handle = limiter.spawn_sweeper(SWEEP_INTERVAL, cancel.clone());
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(limiter.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
