//! Rate-limited logging side-state.
//!
//! The original Python implementation (`logging_filter.py`) attaches a
//! `logging.Filter` to the root logger and keys suppression off
//! `extra={"rate_limit_tag": ..., "rate_limit_timeout": ...}`. A global
//! logging filter doesn't fit idiomatic Rust logging (`log`/`env_logger`
//! filter on level and target, not on arbitrary record extras), so this is
//! a plain side-table each call site consults directly before logging: a
//! log record carries an optional (tag, window) pair, and this side-state
//! keeps the next-allowed-instant per tag.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default suppression window for repeated per-connection warnings
/// ("device not found for X"), matching `LOG_RATE_LIMIT_DEFAULT` (600s) in
/// the original.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Tracks the next-allowed-instant per tag.
pub struct RateLimiter {
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if a log for `tag` should be emitted now, and arms the
    /// suppression window for the next `window` seconds. Call sites should
    /// only log when this returns true.
    pub fn allow(&self, tag: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut map = self.next_allowed.lock().unwrap();
        match map.get(tag) {
            Some(next) if *next > now => false,
            _ => {
                map.insert(tag.to_string(), now + window);
                true
            }
        }
    }

    /// `allow` with the default 10-minute window.
    pub fn allow_default(&self, tag: &str) -> bool {
        self.allow(tag, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_within_window() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("dev-missing-eth0", Duration::from_secs(60)));
        assert!(!limiter.allow("dev-missing-eth0", Duration::from_secs(60)));
    }

    #[test]
    fn distinct_tags_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", Duration::from_secs(60)));
        assert!(limiter.allow("b", Duration::from_secs(60)));
    }
}
