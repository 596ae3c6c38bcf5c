//! Connection retry policy: decorrelated-jitter backoff (spec.md §5).
//!
//! Ported from `pgsql_compute_connection_retry_sleep_time` /
//! `pgsql_retry_policy_expired` in the original keeper's `pgsql.c`. The sleep
//! computation is a pure function so it can be unit-tested without a clock or
//! RNG dependency injected through real time.

use std::time::{Duration, Instant};

use rand::Rng;

/// `maxAttempts = 0` means "do not retry at all"; `-1` means unbounded.
pub const UNLIMITED_ATTEMPTS: i32 = -1;
pub const NO_RETRY: i32 = 0;

#[derive(Debug, Clone)]
pub struct ConnectionRetryPolicy {
    pub max_total: Duration,
    pub max_attempts: i32,
    pub cap_sleep: Duration,
    pub base_sleep: Duration,
    start_time: Option<Instant>,
    attempts: u32,
    last_sleep: Duration,
}

impl ConnectionRetryPolicy {
    pub fn new(max_total: Duration, max_attempts: i32, cap_sleep: Duration, base_sleep: Duration) -> Self {
        ConnectionRetryPolicy {
            max_total,
            max_attempts,
            cap_sleep,
            base_sleep,
            start_time: None,
            attempts: 0,
            last_sleep: Duration::ZERO,
        }
    }

    /// *local-postgres* profile: no retry at all.
    pub fn local_postgres() -> Self {
        ConnectionRetryPolicy::new(Duration::ZERO, NO_RETRY, Duration::ZERO, Duration::ZERO)
    }

    /// *main-loop-to-monitor* profile: the outer keeper loop is the retry
    /// loop, a single `NodeActive` call does not retry internally.
    pub fn main_loop(postgres_ping_retry_timeout: Duration) -> Self {
        ConnectionRetryPolicy::new(
            postgres_ping_retry_timeout,
            NO_RETRY,
            Duration::from_millis(2000),
            Duration::from_millis(100),
        )
    }

    /// *init* profile: unbounded attempts, 15 minutes total.
    pub fn init() -> Self {
        ConnectionRetryPolicy::new(
            Duration::from_secs(15 * 60),
            UNLIMITED_ATTEMPTS,
            Duration::from_millis(2000),
            Duration::from_millis(100),
        )
    }

    /// *interactive* profile: unbounded attempts, bounded by `PGCONNECT_TIMEOUT`.
    pub fn interactive(pgconnect_timeout: Duration) -> Self {
        ConnectionRetryPolicy::new(
            pgconnect_timeout,
            UNLIMITED_ATTEMPTS,
            Duration::from_millis(2000),
            Duration::from_millis(100),
        )
    }

    /// *monitor-interactive* profile: unbounded attempts, 15 minutes total,
    /// 5s cap, starting at a 1s sleep.
    pub fn monitor_interactive() -> Self {
        ConnectionRetryPolicy::new(
            Duration::from_secs(15 * 60),
            UNLIMITED_ATTEMPTS,
            Duration::from_millis(5000),
            Duration::from_millis(1000),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Computes the next sleep duration ("Decorrelated Jitter": `sleep =
    /// min(cap, random_between(base, last_sleep * 3))`) and records the
    /// attempt. Exposed as a pure function of `(base, cap, last)` plus an
    /// injected RNG so it is deterministically testable.
    pub fn next_sleep(&mut self) -> Duration {
        self.start_time.get_or_insert_with(Instant::now);

        let lo = self.base_sleep;
        let hi = std::cmp::max(lo, self.last_sleep.saturating_mul(3));
        let sleep = next_sleep_in_range(lo, hi, self.cap_sleep);

        self.last_sleep = sleep;
        self.attempts += 1;
        sleep
    }

    /// Mirrors `pgsql_retry_policy_expired`: stop retrying once we've spent
    /// the whole time budget or attempt budget, whichever comes first.
    /// Signals are handled by the caller (they "always win over retry" per
    /// spec.md §7) and are not modeled here.
    pub fn expired(&self) -> bool {
        let elapsed = self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);

        if elapsed >= self.max_total {
            return true;
        }

        if self.max_attempts > 0 && self.attempts >= self.max_attempts as u32 {
            return true;
        }

        false
    }

    pub fn reset(&mut self) {
        self.start_time = None;
        self.attempts = 0;
        self.last_sleep = Duration::ZERO;
    }
}

fn next_sleep_in_range(lo: Duration, hi: Duration, cap: Duration) -> Duration {
    let lo_ms = lo.as_millis().max(0) as u64;
    let hi_ms = hi.as_millis().max(lo_ms as u128) as u64;
    let picked = if hi_ms <= lo_ms {
        lo_ms
    } else {
        rand::thread_rng().gen_range(lo_ms..=hi_ms)
    };
    std::cmp::min(Duration::from_millis(picked), cap)
}
