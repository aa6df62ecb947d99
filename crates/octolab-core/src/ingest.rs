use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use octolab_domain::LabId;
use sha2::{Digest, Sha256};

const RATE_LIMIT_WINDOW_SECONDS: i64 = 60;
const RATE_LIMIT_REAP_INTERVAL_SECONDS: i64 = 300;
const DEDUP_CAP: usize = 10_000;

/// Injectable wall clock, so rate-limit/dedup window tests don't depend on
/// real elapsed time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct RateWindow {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Per-lab sliding-window rate limiter for the evidence ingest endpoint.
/// Lives in-process rather than in the store — it is a cheap, best-effort
/// guard against a misbehaving agent, not an audited invariant.
pub struct RateLimiter {
    clock: Box<dyn Clock>,
    limit_per_minute: u32,
    windows: Mutex<HashMap<LabId, RateWindow>>,
    last_reap: Mutex<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32, clock: Box<dyn Clock>) -> Self {
        let now = clock.now();
        RateLimiter {
            clock,
            limit_per_minute,
            windows: Mutex::new(HashMap::new()),
            last_reap: Mutex::new(now),
        }
    }

    /// Returns `true` if the event is admitted, `false` if the lab has
    /// exceeded its quota for the current window.
    pub fn check(&self, lab_id: &LabId) -> bool {
        let now = self.clock.now();
        self.reap_if_due(now);

        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let entry = windows.entry(*lab_id).or_insert_with(|| RateWindow {
            count: 0,
            window_start: now,
        });

        if (now - entry.window_start).num_seconds() > RATE_LIMIT_WINDOW_SECONDS {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.limit_per_minute {
            return false;
        }
        entry.count += 1;
        true
    }

    fn reap_if_due(&self, now: DateTime<Utc>) {
        let mut last_reap = self.last_reap.lock().expect("rate limiter lock poisoned");
        if (now - *last_reap).num_seconds() < RATE_LIMIT_REAP_INTERVAL_SECONDS {
            return;
        }
        *last_reap = now;
        drop(last_reap);

        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows.retain(|_, w| (now - w.window_start).num_seconds() <= RATE_LIMIT_WINDOW_SECONDS);
    }
}

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

/// Content-addressed dedup cache for evidence events. Keys are the
/// sha256 hex digest of the event's canonical "kind+timestamp+subject+key
/// fields" string; values are the expiry time. Bounded to [`DEDUP_CAP`]
/// entries — exceeding the cap triggers a sweep of expired entries before
/// admitting the new one.
pub struct DedupCache {
    clock: Box<dyn Clock>,
    ttl_seconds: i64,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupCache {
    pub fn new(ttl_seconds: u32, clock: Box<dyn Clock>) -> Self {
        DedupCache {
            clock,
            ttl_seconds: ttl_seconds as i64,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn canonical_key(kind: &str, timestamp: &str, subject: &str, key_fields: &str) -> String {
        let canonical = format!("{kind}|{timestamp}|{subject}|{key_fields}");
        let digest = Sha256::digest(canonical.as_bytes());
        hex_encode(&digest)
    }

    /// Checks whether `key` has been seen within its TTL. A fresh key is
    /// recorded and reported `New`; a key already present and unexpired is
    /// reported `Duplicate` and has its TTL extended.
    pub fn check(&self, key: &str) -> DedupOutcome {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("dedup cache lock poisoned");

        if entries.len() >= DEDUP_CAP {
            entries.retain(|_, expiry| *expiry > now);
        }

        match entries.get(key) {
            Some(expiry) if *expiry > now => {
                entries.insert(key.to_string(), now + chrono::Duration::seconds(self.ttl_seconds));
                DedupOutcome::Duplicate
            }
            _ => {
                entries.insert(key.to_string(), now + chrono::Duration::seconds(self.ttl_seconds));
                DedupOutcome::New
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeClock {
        offset_seconds: AtomicI64,
        base: DateTime<Utc>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock {
                offset_seconds: AtomicI64::new(0),
                base: "2026-01-01T00:00:00Z".parse().unwrap(),
            }
        }

        fn advance(&self, seconds: i64) {
            self.offset_seconds.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::seconds(self.offset_seconds.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn rate_limiter_admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(3, Box::new(FakeClock::new()));
        let lab_id = LabId::generate();
        assert!(limiter.check(&lab_id));
        assert!(limiter.check(&lab_id));
        assert!(limiter.check(&lab_id));
        assert!(!limiter.check(&lab_id));
    }

    #[test]
    fn rate_limiter_resets_after_the_window_elapses() {
        let clock = std::sync::Arc::new(FakeClock::new());
        let limiter = RateLimiter::new(1, Box::new(SharedClock(clock.clone())));
        let lab_id = LabId::generate();
        assert!(limiter.check(&lab_id));
        assert!(!limiter.check(&lab_id));
        clock.advance(61);
        assert!(limiter.check(&lab_id));
    }

    /// Wraps a shared `FakeClock` so both the component under test and the
    /// test body can observe/advance the same clock.
    #[derive(Clone)]
    struct SharedClock(std::sync::Arc<FakeClock>);

    impl Clock for SharedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0.now()
        }
    }

    #[test]
    fn dedup_cache_flags_repeated_keys_as_duplicate() {
        let cache = DedupCache::new(300, Box::new(FakeClock::new()));
        let key = DedupCache::canonical_key("teardown", "2026-01-01T00:00:00Z", "lab-1", "");
        assert_eq!(cache.check(&key), DedupOutcome::New);
        assert_eq!(cache.check(&key), DedupOutcome::Duplicate);
    }

    #[test]
    fn dedup_cache_expires_keys_after_ttl() {
        let clock = std::sync::Arc::new(FakeClock::new());
        let cache = DedupCache::new(60, Box::new(SharedClock(clock.clone())));
        let key = DedupCache::canonical_key("teardown", "2026-01-01T00:00:00Z", "lab-1", "");
        assert_eq!(cache.check(&key), DedupOutcome::New);
        clock.advance(61);
        assert_eq!(cache.check(&key), DedupOutcome::New);
    }
}
