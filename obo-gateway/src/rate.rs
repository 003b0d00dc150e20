//! Fixed-window rate limiting for outbound calls.
//!
//! Used to bound JWKS refetches per issuer and token-exchange calls per
//! `(session, audience)` when the delegation cache is disabled. Exhaustion
//! surfaces as a typed error, never as a stall.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("rate limit exceeded")]
pub struct RateLimited;

pub struct FixedWindow<K> {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState<K>>,
}

struct WindowState<K> {
    started: Instant,
    counts: HashMap<K, u32>,
}

impl<K: Eq + Hash> FixedWindow<K> {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                counts: HashMap::new(),
            }),
        }
    }

    /// Counts one attempt against `key`; errors once the per-window limit is
    /// exceeded.
    pub fn check(&self, key: K) -> Result<(), RateLimited> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: K, now: Instant) -> Result<(), RateLimited> {
        let mut state = self.state.lock();

        if now.duration_since(state.started) > self.window {
            state.started = now;
            state.counts.clear();
        }

        let count = state.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);

        if *count > self.limit { Err(RateLimited) } else { Ok(()) }
    }
}
