//! Sliding-window rate limiting
//!
//! Each identifier owns the timestamps of its admitted requests inside the
//! trailing window. Admission prunes expired timestamps and appends the new
//! one under the bucket's shard lock, so concurrent callers and the
//! background sweep never interleave on the same bucket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

use crate::config::LimiterConfig;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Configured maximum per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Time until the earliest counted request leaves the window
    pub reset_after: Duration,
    /// Time until a request would be admitted; zero when allowed
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Reset time as Unix seconds, rounded up
    #[must_use]
    pub fn reset_unix(&self) -> u64 {
        let at = SystemTime::now() + self.reset_after;
        let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        since.as_secs() + u64::from(since.subsec_nanos() > 0)
    }

    /// `Retry-After` value in whole seconds, at least 1 on rejection
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Per-identifier sliding-window limiter
pub struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window: Duration,
    cleanup_interval: Duration,
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    #[must_use]
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            window: config.window,
            cleanup_interval: config.cleanup_interval,
            buckets: DashMap::new(),
        }
    }

    /// Whether limiting is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check and record a request for `id`. `None` when disabled.
    pub fn allow(&self, id: &str) -> Option<RateLimitDecision> {
        self.admit(id, Instant::now)
    }

    /// [`Self::allow`] at an explicit instant
    pub fn allow_at(&self, id: &str, now: Instant) -> Option<RateLimitDecision> {
        self.admit(id, || now)
    }

    /// The clock is read while the bucket is locked so timestamps are
    /// appended in order.
    fn admit(&self, id: &str, clock: impl FnOnce() -> Instant) -> Option<RateLimitDecision> {
        if !self.enabled {
            return None;
        }

        let mut bucket = self.buckets.entry(id.to_string()).or_default();
        let now = clock();
        prune(&mut bucket, now, self.window);

        let count = u32::try_from(bucket.len()).unwrap_or(u32::MAX);
        if count < self.max_requests {
            bucket.push_back(now);
            let reset_after = bucket
                .front()
                .map_or(self.window, |earliest| self.until_expiry(*earliest, now));
            return Some(RateLimitDecision {
                allowed: true,
                limit: self.max_requests,
                remaining: self.max_requests - (count + 1),
                reset_after,
                retry_after: Duration::ZERO,
            });
        }

        let retry_after = bucket
            .front()
            .map_or(self.window, |oldest| self.until_expiry(*oldest, now));
        Some(RateLimitDecision {
            allowed: false,
            limit: self.max_requests,
            remaining: 0,
            reset_after: retry_after,
            retry_after,
        })
    }

    fn until_expiry(&self, timestamp: Instant, now: Instant) -> Duration {
        (timestamp + self.window).saturating_duration_since(now)
    }

    /// Drop buckets left empty after pruning. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`Self::sweep`] at an explicit instant
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            prune(bucket, now, self.window);
            !bucket.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of identifiers currently tracked
    #[must_use]
    pub fn tracked_identifiers(&self) -> usize {
        self.buckets.len()
    }
}

/// Remove timestamps that are a full window old or more
fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while bucket
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        bucket.pop_front();
    }
}

/// Spawn the periodic sweep for `limiter`.
///
/// The task exits when the `shutdown` receiver fires. Nothing is spawned
/// for a disabled limiter or a zero interval.
pub fn spawn_sweeper(
    name: &'static str,
    limiter: Arc<RateLimiter>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    if !limiter.enabled || limiter.cleanup_interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limiter.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(limiter = name, count = removed, "Evicted idle rate-limit buckets");
                    }
                }
                _ = shutdown.recv() => {
                    debug!(limiter = name, "Rate-limit sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&LimiterConfig {
            enabled: true,
            max_requests,
            window: Duration::from_secs(window_secs),
            cleanup_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let rl = limiter(2, 60);
        let t0 = Instant::now();

        let first = rl.allow_at("a", t0).unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.retry_after, Duration::ZERO);

        let second = rl.allow_at("a", t0 + Duration::from_secs(1)).unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        // reset follows the earliest surviving request
        assert_eq!(second.reset_after, Duration::from_secs(59));

        let third = rl.allow_at("a", t0 + Duration::from_secs(10)).unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after, Duration::from_secs(50));
        assert_eq!(third.retry_after_secs(), 50);
    }

    #[test]
    fn identifiers_do_not_share_quota() {
        let rl = limiter(1, 60);
        let t0 = Instant::now();
        assert!(rl.allow_at("a", t0).unwrap().allowed);
        assert!(rl.allow_at("b", t0).unwrap().allowed);
        assert!(!rl.allow_at("a", t0).unwrap().allowed);
        assert!(!rl.allow_at("b", t0).unwrap().allowed);
    }

    #[test]
    fn window_slides() {
        let rl = limiter(2, 60);
        let t0 = Instant::now();
        rl.allow_at("a", t0);
        rl.allow_at("a", t0 + Duration::from_secs(30));
        assert!(!rl.allow_at("a", t0 + Duration::from_secs(59)).unwrap().allowed);

        // first request leaves the window, second still counts
        let d = rl.allow_at("a", t0 + Duration::from_secs(60)).unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(!rl.allow_at("a", t0 + Duration::from_secs(61)).unwrap().allowed);
    }

    #[test]
    fn rejections_are_not_recorded() {
        let rl = limiter(1, 60);
        let t0 = Instant::now();
        rl.allow_at("a", t0);
        for s in 1..30 {
            rl.allow_at("a", t0 + Duration::from_secs(s));
        }
        assert!(rl.allow_at("a", t0 + Duration::from_secs(60)).unwrap().allowed);
    }

    #[test]
    fn disabled_limiter_bypasses() {
        let rl = RateLimiter::new(&LimiterConfig {
            enabled: false,
            ..LimiterConfig::default()
        });
        for _ in 0..1000 {
            assert!(rl.allow("a").is_none());
        }
        assert_eq!(rl.tracked_identifiers(), 0);
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let rl = limiter(0, 60);
        let d = rl.allow("a").unwrap();
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Duration::from_secs(60));
    }

    #[test]
    fn sweep_evicts_only_idle_buckets() {
        let rl = limiter(5, 60);
        let t0 = Instant::now();
        rl.allow_at("old", t0);
        rl.allow_at("new", t0 + Duration::from_secs(50));
        assert_eq!(rl.tracked_identifiers(), 2);

        assert_eq!(rl.sweep_at(t0 + Duration::from_secs(70)), 1);
        assert_eq!(rl.tracked_identifiers(), 1);
        assert_eq!(rl.sweep_at(t0 + Duration::from_secs(200)), 1);
        assert_eq!(rl.tracked_identifiers(), 0);
    }

    #[test]
    fn retry_after_rounds_up() {
        let d = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_after: Duration::from_millis(1500),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(d.retry_after_secs(), 2);

        let tiny = RateLimitDecision {
            retry_after: Duration::from_millis(1),
            ..d
        };
        assert_eq!(tiny.retry_after_secs(), 1);
    }

    #[test]
    fn concurrent_admissions_respect_limit() {
        let rl = Arc::new(limiter(100, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || {
                    (0..50).filter(|_| rl.allow("shared").unwrap().allowed).count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }

    #[test]
    fn clock_is_read_under_the_bucket_lock() {
        let rl = limiter(5, 60);
        let decision = rl.admit("a", || {
            assert!(matches!(
                rl.buckets.try_get("a"),
                dashmap::try_result::TryResult::Locked
            ));
            Instant::now()
        });
        assert!(decision.unwrap().allowed);
    }

    #[test]
    fn concurrent_admissions_keep_timestamps_ordered() {
        let rl = Arc::new(limiter(10_000, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        rl.allow("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let bucket = rl.buckets.get("shared").unwrap();
        assert_eq!(bucket.len(), 1600);
        assert!(bucket.iter().zip(bucket.iter().skip(1)).all(|(a, b)| a <= b));
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let rl = Arc::new(RateLimiter::new(&LimiterConfig {
            enabled: true,
            max_requests: 5,
            window: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(20),
        }));
        rl.allow("a");
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        spawn_sweeper("test", Arc::clone(&rl), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rl.tracked_identifiers(), 0);
        tx.send(()).unwrap();
    }
}
