//! Fixed-window request counting for the anonymous endpoints.
//!
//! A counter is `{count, reset_at}` per client key. The first hit, or any hit
//! after `reset_at`, starts a new window with `count = 1`; every other hit
//! increments. Increments for one key are serialised by the store.

use axum::http::HeaderMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub window_ms: i64,
    pub max_requests: u32,
    pub message: &'static str,
}

impl Policy {
    /// 5 attempts per 15 minutes
    pub const LOGIN: Policy = Policy {
        window_ms: 15 * 60 * 1000,
        max_requests: 5,
        message: "Too many login attempts. Please try again later.",
    };

    /// 3 registrations per hour
    pub const REGISTRATION: Policy = Policy {
        window_ms: 60 * 60 * 1000,
        max_requests: 3,
        message: "Registration limit exceeded. Please try again later.",
    };

    /// 30 anonymous CSRF token fetches per minute
    pub const TOKEN_ISSUANCE: Policy = Policy {
        window_ms: 60 * 1000,
        max_requests: 30,
        message: "Too many token requests. Please try again later.",
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: u32,
    pub reset_at: i64,
}

impl Counter {
    fn fresh(now: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            reset_at: now + window_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch milliseconds at which the current window ends.
    pub reset_at: i64,
    pub message: Option<&'static str>,
}

impl Decision {
    /// Seconds until the window ends, rounded up.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let left = (self.reset_at - now_ms).max(0);
        ((left + 999) / 1000) as u64
    }
}

/// Backing storage for counters.
///
/// `hit` must be atomic per key: two concurrent hits for the same key must
/// both be counted.
pub trait CounterStore: Send + Sync {
    fn hit(&self, key: &str, now: i64, window_ms: i64) -> Counter;

    /// Drops counters whose window ended before `now`; returns how many.
    fn sweep(&self, now: i64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store. The dashmap entry guard holds the shard lock for the
/// whole read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn hit(&self, key: &str, now: i64, window_ms: i64) -> Counter {
        match self.counters.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let counter = entry.get_mut();
                if now > counter.reset_at {
                    *counter = Counter::fresh(now, window_ms);
                } else {
                    counter.count = counter.count.saturating_add(1);
                }
                *counter
            }
            Entry::Vacant(entry) => *entry.insert(Counter::fresh(now, window_ms)),
        }
    }

    fn sweep(&self, now: i64) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.reset_at >= now);
        before.saturating_sub(self.counters.len())
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}

/// Turns a request into the key its counter is filed under.
pub trait ClientIdentity: Send + Sync {
    fn identify(&self, headers: &HeaderMap) -> String;
}

/// `{ip}_{auth}` from proxy headers and the `Authorization` header.
///
/// Clients behind one NAT share an address, and the headers are whatever the
/// nearest proxy (or the client) chose to send, so this is only a heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderHeuristic;

impl ClientIdentity for HeaderHeuristic {
    fn identify(&self, headers: &HeaderMap) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| header("x-real-ip"))
            .unwrap_or("unknown");

        let auth = match header("authorization") {
            Some(value) => {
                let prefix: String = value.chars().take(10).collect();
                let digest = Sha256::digest(prefix.as_bytes());
                format!("user_{}", &hex::encode(digest)[..12])
            }
            None => "anonymous".to_string(),
        };

        format!("{}_{}", ip, auth)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    identity: Arc<dyn ClientIdentity>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_parts(
            Arc::new(MemoryCounterStore::new()),
            Arc::new(HeaderHeuristic),
            clock,
        )
    }

    pub fn with_parts(
        store: Arc<dyn CounterStore>,
        identity: Arc<dyn ClientIdentity>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
        }
    }

    pub fn identifier(&self, headers: &HeaderMap) -> String {
        self.identity.identify(headers)
    }

    pub fn check(&self, identifier: &str, policy: &Policy) -> Decision {
        let now = self.clock.now_millis();
        let counter = self.store.hit(identifier, now, policy.window_ms);
        if counter.count > policy.max_requests {
            Decision {
                allowed: false,
                remaining: 0,
                reset_at: counter.reset_at,
                message: Some(policy.message),
            }
        } else {
            Decision {
                allowed: true,
                remaining: policy.max_requests - counter.count,
                reset_at: counter.reset_at,
                message: None,
            }
        }
    }

    /// Checks `policy` for the request's client under `namespace`, mapping a
    /// rejection to a 429 with `Retry-After`.
    pub fn admit(&self, namespace: &str, headers: &HeaderMap, policy: &Policy) -> Result<Decision, Error> {
        let key = format!("{}:{}", namespace, self.identifier(headers));
        let decision = self.check(&key, policy);
        if decision.allowed {
            return Ok(decision);
        }
        let retry_after = decision.retry_after_secs(self.clock.now_millis());
        log::warn!("rate limited {} for {}s", key, retry_after);
        Err(Error::RateLimited {
            message: policy.message.to_string(),
            retry_after,
        })
    }

    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_millis())
    }

    pub fn tracked(&self) -> usize {
        self.store.len()
    }
}

/// Periodically drops elapsed counters. Expired counters that have not been
/// swept yet are still reset correctly on their next hit.
pub fn spawn_sweeper(limiter: RateLimiter, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = limiter.sweep();
            log::debug!(
                "rate limit sweep removed {} counters, {} left",
                removed,
                limiter.tracked()
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};

    const W: i64 = 60_000;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        (RateLimiter::new(Arc::new(clock.clone())), clock)
    }

    fn policy(max: u32) -> Policy {
        Policy {
            window_ms: W,
            max_requests: max,
            message: "limited",
        }
    }

    #[test]
    fn allows_exactly_max_then_rejects() {
        let (limiter, _) = limiter();
        let policy = policy(5);
        for expected_remaining in (0..5).rev() {
            let decision = limiter.check("client", &policy);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.message, None);
        }
        let sixth = limiter.check("client", &policy);
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.message, Some("limited"));
    }

    #[test]
    fn window_resets_after_reset_at() {
        let (limiter, clock) = limiter();
        let policy = policy(5);
        let first = limiter.check("client", &policy);
        for _ in 0..5 {
            limiter.check("client", &policy);
        }
        assert!(!limiter.check("client", &policy).allowed);

        // still inside the window at exactly reset_at
        clock.set(Utc.timestamp_millis_opt(first.reset_at).unwrap());
        assert!(!limiter.check("client", &policy).allowed);

        clock.advance(chrono::Duration::milliseconds(1));
        let fresh = limiter.check("client", &policy);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
        assert_eq!(fresh.reset_at, first.reset_at + 1 + W);
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _) = limiter();
        let policy = policy(1);
        assert!(limiter.check("a", &policy).allowed);
        assert!(!limiter.check("a", &policy).allowed);
        assert!(limiter.check("b", &policy).allowed);
    }

    #[test]
    fn retry_after_rounds_up() {
        let decision = Decision {
            allowed: false,
            remaining: 0,
            reset_at: 10_001,
            message: None,
        };
        assert_eq!(decision.retry_after_secs(0), 11);
        assert_eq!(decision.retry_after_secs(9_001), 1);
        assert_eq!(decision.retry_after_secs(10_001), 0);
        assert_eq!(decision.retry_after_secs(20_000), 0);
    }

    #[test]
    fn admit_maps_rejection_to_429() {
        let (limiter, clock) = limiter();
        let headers = HeaderMap::new();
        for _ in 0..5 {
            limiter.admit("login", &headers, &Policy::LOGIN).unwrap();
        }
        clock.advance(chrono::Duration::milliseconds(100_500));
        match limiter.admit("login", &headers, &Policy::LOGIN) {
            Err(Error::RateLimited { retry_after, .. }) => {
                // 900s window, 100.5s elapsed
                assert_eq!(retry_after, 800);
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        // other namespaces keep their own counters
        assert!(limiter.admit("register", &headers, &Policy::REGISTRATION).is_ok());
    }

    #[test]
    fn sweep_drops_only_elapsed_windows() {
        let (limiter, clock) = limiter();
        limiter.check("old", &policy(5));
        clock.advance(chrono::Duration::milliseconds(W / 2));
        limiter.check("new", &policy(5));
        assert_eq!(limiter.tracked(), 2);

        clock.advance(chrono::Duration::milliseconds(W / 2 + 1));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn concurrent_hits_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        store.hit("shared", 0, W);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.hit("shared", 0, W).count, 8 * 500 + 1);
    }

    #[test]
    fn concurrent_checks_admit_exactly_the_limit() {
        let (limiter, _) = limiter();
        let policy = policy(50);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.check("burst", &policy).allowed)
                        .count()
                })
            })
            .collect();
        let allowed: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(allowed, 50);
        assert!(!limiter.check("burst", &policy).allowed);
    }

    #[test]
    fn identifier_heuristic() {
        let id = HeaderHeuristic;
        assert_eq!(id.identify(&HeaderMap::new()), "unknown_anonymous");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(id.identify(&headers), "10.0.0.2_anonymous");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"),
        );
        assert_eq!(id.identify(&headers), "203.0.113.9_anonymous");

        headers.insert("authorization", HeaderValue::from_static("Bearer abcdef123456"));
        let authed = id.identify(&headers);
        assert!(authed.starts_with("203.0.113.9_user_"));
        assert_eq!(authed.len(), "203.0.113.9_user_".len() + 12);

        // only the first 10 characters feed the hash
        headers.insert("authorization", HeaderValue::from_static("Bearer abcdef999999"));
        assert_eq!(id.identify(&headers), authed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let (limiter, clock) = limiter();
        limiter.check("gone", &policy(5));
        clock.advance(chrono::Duration::milliseconds(W + 1));

        let handle = spawn_sweeper(limiter.clone(), Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(limiter.tracked(), 0);
        handle.abort();
    }
}
