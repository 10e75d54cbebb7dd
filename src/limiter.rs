use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::clock::SharedClock;

/// Number of lock stripes. Power of two for mask reduction, independent of
/// the cache's shard count.
const NUM_STRIPES: usize = 16;
const STRIPE_MASK: u64 = (NUM_STRIPES as u64) - 1;

/// Admission strategy for the per-identity buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateStrategy {
    /// Classic token bucket: refill by elapsed time, spend on acquire.
    Token,
    /// Leaky bucket: acquires fill the bucket, time drains it. Equivalent
    /// deny/admit behavior, smoother drift under steady load.
    Leaky,
    /// No limiting; every acquire succeeds.
    None,
}

/// Per-identity reservoir. `level` means "tokens available" for the token
/// strategy and "fill" for the leaky strategy.
struct Bucket {
    level: f64,
    last_update: Instant,
}

struct Stripe {
    buckets: HashMap<String, Bucket>,
    last_gc: Instant,
}

/// Token/leaky-bucket admission guard keyed per caller identity.
///
/// Buckets live in a lock-striped map (fixed-seed ahash over the
/// identity), so concurrent callers with different identities rarely
/// contend. `try_acquire` never blocks: a deny is immediate. Buckets idle
/// longer than the GC period are dropped lazily during later acquires on
/// the same stripe.
pub struct RateLimiter {
    strategy: RateStrategy,
    capacity: f64,
    refill_per_second: f64,
    idle_gc: Duration,
    clock: SharedClock,
    stripes: Vec<Mutex<Stripe>>,
    hasher: ahash::RandomState,
}

impl RateLimiter {
    pub fn new(
        strategy: RateStrategy,
        capacity: u64,
        refill_per_second: f64,
        idle_gc: Duration,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let stripes = (0..NUM_STRIPES)
            .map(|_| {
                Mutex::new(Stripe {
                    buckets: HashMap::new(),
                    last_gc: now,
                })
            })
            .collect();
        RateLimiter {
            strategy,
            capacity: capacity as f64,
            refill_per_second,
            idle_gc,
            clock,
            stripes,
            hasher: ahash::RandomState::with_seeds(5, 6, 7, 8),
        }
    }

    /// Try to take `n` units for `identity`. Never blocks.
    pub fn try_acquire(&self, identity: &str, n: u32) -> bool {
        if self.strategy == RateStrategy::None {
            return true;
        }
        let now = self.clock.now();
        let stripe_idx = (self.hasher.hash_one(identity) & STRIPE_MASK) as usize;
        let mut stripe = self.stripes[stripe_idx].lock();

        if now.saturating_duration_since(stripe.last_gc) >= self.idle_gc {
            let idle_gc = self.idle_gc;
            stripe
                .buckets
                .retain(|_, b| now.saturating_duration_since(b.last_update) < idle_gc);
            stripe.last_gc = now;
        }

        let bucket = stripe
            .buckets
            .entry(identity.to_owned())
            .or_insert_with(|| Bucket {
                level: match self.strategy {
                    RateStrategy::Token => self.capacity,
                    _ => 0.0,
                },
                last_update: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;
        let n = n as f64;

        match self.strategy {
            RateStrategy::Token => {
                bucket.level = (bucket.level + elapsed * self.refill_per_second).min(self.capacity);
                if bucket.level >= n {
                    bucket.level -= n;
                    true
                } else {
                    false
                }
            }
            RateStrategy::Leaky => {
                bucket.level = (bucket.level - elapsed * self.refill_per_second).max(0.0);
                if bucket.level + n <= self.capacity {
                    bucket.level += n;
                    true
                } else {
                    false
                }
            }
            RateStrategy::None => true,
        }
    }

    /// Live buckets across all stripes (test/introspection helper).
    pub fn bucket_count(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().buckets.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::clock::ManualClock;

    use super::*;

    fn limiter(strategy: RateStrategy, capacity: u64, refill: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(
            strategy,
            capacity,
            refill,
            Duration::from_secs(300),
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn token_bucket_starts_full_and_drains() {
        let (limiter, _clock) = limiter(RateStrategy::Token, 5, 1.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire("alice", 1));
        }
        assert!(!limiter.try_acquire("alice", 1), "sixth acquire must fail");
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let (limiter, clock) = limiter(RateStrategy::Token, 5, 1.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire("alice", 1));
        }
        assert!(!limiter.try_acquire("alice", 1));
        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire("alice", 1));
        assert!(!limiter.try_acquire("alice", 1));
    }

    #[test]
    fn refill_clamps_at_capacity() {
        let (limiter, clock) = limiter(RateStrategy::Token, 3, 10.0);
        clock.advance(Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.try_acquire("alice", 1));
        }
        assert!(!limiter.try_acquire("alice", 1));
    }

    #[test]
    fn identities_are_independent() {
        let (limiter, _clock) = limiter(RateStrategy::Token, 2, 1.0);
        assert!(limiter.try_acquire("alice", 2));
        assert!(!limiter.try_acquire("alice", 1));
        assert!(limiter.try_acquire("bob", 1), "bob has his own bucket");
    }

    #[test]
    fn leaky_bucket_admits_until_full() {
        let (limiter, clock) = limiter(RateStrategy::Leaky, 3, 1.0);
        for _ in 0..3 {
            assert!(limiter.try_acquire("alice", 1));
        }
        assert!(!limiter.try_acquire("alice", 1));
        clock.advance(Duration::from_secs(2));
        assert!(limiter.try_acquire("alice", 1));
        assert!(limiter.try_acquire("alice", 1));
        assert!(!limiter.try_acquire("alice", 1));
    }

    #[test]
    fn none_strategy_always_admits() {
        let (limiter, _clock) = limiter(RateStrategy::None, 0, 0.0);
        for _ in 0..1000 {
            assert!(limiter.try_acquire("anyone", 1));
        }
        assert_eq!(limiter.bucket_count(), 0, "none strategy keeps no buckets");
    }

    #[test]
    fn multi_unit_acquire() {
        let (limiter, _clock) = limiter(RateStrategy::Token, 10, 1.0);
        assert!(limiter.try_acquire("alice", 7));
        assert!(!limiter.try_acquire("alice", 4));
        assert!(limiter.try_acquire("alice", 3));
    }

    #[test]
    fn idle_buckets_are_collected() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(
            RateStrategy::Token,
            5,
            1.0,
            Duration::from_secs(60),
            clock.clone(),
        );
        assert!(limiter.try_acquire("alice", 1));
        assert_eq!(limiter.bucket_count(), 1);

        // Bucket sits idle past the GC period; the next acquire on the
        // same stripe sweeps it.
        clock.advance(Duration::from_secs(120));
        assert!(limiter.try_acquire("alice", 1));
        assert_eq!(limiter.bucket_count(), 1, "alice was recreated, not leaked");
    }
}
