//! Sliding-window rate limiting.
//!
//! Each key keeps the timestamps of its admitted requests inside the trailing
//! window. A request is admitted while fewer than `limit` timestamps remain.
//! An entry exactly `window` old has expired.
//!
//! Admission only trims the key it checks, so keys that stop sending are never
//! revisited by it. The periodic [`RateLimiter::cleanup`] sweep removes those.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is admitted and recorded.
    Allow,
    /// The request is rejected. Nothing was recorded.
    Deny,
}

impl Decision {
    /// Whether the request was admitted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Returned by [`RateLimiter::check`] when a key is over its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Rate limit exceeded")]
pub struct RateLimitExceeded {
    /// How long until the oldest counted request leaves the window.
    pub retry_after: Option<Duration>,
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests admitted per window. Zero denies everything.
    pub limit: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-key sliding-window rate limiter.
///
/// Keys are sharded across a concurrent map, so admission and cleanup are
/// mutually exclusive per key without a global lock.
#[derive(Debug)]
pub struct RateLimiter<K>
where
    K: Eq + Hash,
{
    requests: DashMap<K, VecDeque<Instant>>,
    config: RateLimitConfig,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a rate limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            requests: DashMap::new(),
            config,
        }
    }

    /// Get the configured limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.config.limit
    }

    /// Get the configured window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Decide whether a request from `key` at `now` is admitted.
    ///
    /// Costs time proportional to the number of requests `key` has inside the
    /// window. A denied request is not recorded. Callers passing their own
    /// clock must not go backwards for a key.
    pub fn admit(&self, key: K, now: Instant) -> Decision {
        self.admit_with(key, || now).0
    }

    /// Admit a request at the current time.
    ///
    /// The clock is read while the key's entry is held, so concurrent
    /// requests for one key are recorded in time order.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] if `key` is over its limit.
    pub fn check(&self, key: K) -> Result<(), RateLimitExceeded> {
        match self.admit_with(key, Instant::now) {
            (Decision::Allow, _) => Ok(()),
            (Decision::Deny, retry_after) => Err(RateLimitExceeded { retry_after }),
        }
    }

    fn admit_with(
        &self,
        key: K,
        clock: impl FnOnce() -> Instant,
    ) -> (Decision, Option<Duration>) {
        if self.config.limit == 0 {
            return (Decision::Deny, None);
        }

        let mut times = self.requests.entry(key).or_default();
        let now = clock();
        prune(&mut times, now, self.config.window);

        if times.len() >= self.config.limit {
            let retry_after = times
                .front()
                .map(|&oldest| (oldest + self.config.window).saturating_duration_since(now));
            return (Decision::Deny, retry_after);
        }

        times.push_back(now);
        (Decision::Allow, None)
    }

    /// Drop expired timestamps from every key and remove keys left empty.
    ///
    /// Returns the number of keys removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.requests.retain(|_, times| {
            prune(times, now, self.config.window);
            if times.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }

    /// Number of requests `key` has recorded, including any not yet pruned.
    #[must_use]
    pub fn recorded(&self, key: &K) -> usize {
        self.requests.get(key).map(|t| t.len()).unwrap_or(0)
    }
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Start a background task that runs [`RateLimiter::cleanup`] every `interval`.
    ///
    /// The task stops when the returned handle is stopped or dropped.
    #[must_use]
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        let limiter = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup(Instant::now());
                trace!(
                    removed,
                    remaining = limiter.tracked_keys(),
                    "Rate limiter cleanup"
                );
            }
        });
        debug!(interval = ?interval, "Rate limiter cleanup started");
        CleanupHandle { task }
    }
}

fn prune(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = times.front() {
        if now.saturating_duration_since(oldest) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
}

/// Handle to the periodic cleanup task.
#[derive(Debug)]
pub struct CleanupHandle {
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stop the cleanup task.
    pub fn stop(self) {
        debug!("Rate limiter cleanup stopped");
        // Drop aborts.
    }

    /// Whether the task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
