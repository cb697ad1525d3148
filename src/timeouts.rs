//! Pure in-memory bookkeeping of per-connection retry deadlines and
//! per-device sticky deadlines. Owned exclusively by the Engine.
//!
//! `now` is an injection point (defaults to `Instant::now`) so tests can
//! drive the clock directly, the same role `TimeoutManager.now()` plays in
//! the original's test suite.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A previously-failing activation may not be retried until this much time
/// has passed (`CONNECTION_ACTIVATION_RETRY_TIMEOUT` in the original).
pub const RETRY_PERIOD: Duration = Duration::from_secs(60);

/// Default sticky period if the config doesn't override it
/// (`DEFAULT_STICKY_CONNECTION_PERIOD`, 900s / 15 minutes in the original).
pub const DEFAULT_STICKY_PERIOD: Duration = Duration::from_secs(900);

pub struct Timeouts {
    now: Box<dyn Fn() -> Instant + Send + Sync>,
    retry_deadline: HashMap<String, Instant>,
    sticky_deadline: HashMap<String, Instant>,
    sticky_period: Duration,
}

impl Timeouts {
    pub fn new(sticky_period: Duration) -> Self {
        Timeouts::with_clock(sticky_period, Instant::now)
    }

    /// Construct with an injected clock function, for tests.
    pub fn with_clock<F>(sticky_period: Duration, now: F) -> Self
    where
        F: Fn() -> Instant + Send + Sync + 'static,
    {
        Timeouts {
            now: Box::new(now),
            retry_deadline: HashMap::new(),
            sticky_deadline: HashMap::new(),
            sticky_period,
        }
    }

    fn now(&self) -> Instant {
        (self.now)()
    }

    /// Arm the retry deadline for `profile_id`, 60s from now.
    pub fn arm_retry(&mut self, profile_id: &str) {
        self.retry_deadline
            .insert(profile_id.to_string(), self.now() + RETRY_PERIOD);
    }

    /// Clear the retry deadline (set it to "now", so `retry_active` reports
    /// false immediately) without removing the bookkeeping entry.
    pub fn clear_retry(&mut self, profile_id: &str) {
        self.retry_deadline.insert(profile_id.to_string(), self.now());
    }

    pub fn retry_active(&self, profile_id: &str) -> bool {
        match self.retry_deadline.get(profile_id) {
            Some(deadline) => *deadline >= self.now(),
            None => false,
        }
    }

    /// Arm the sticky deadline for `device_name`, `sticky_period` from now.
    pub fn arm_sticky(&mut self, device_name: &str) {
        self.sticky_deadline
            .insert(device_name.to_string(), self.now() + self.sticky_period);
    }

    /// Drop every sticky deadline (activating an ethernet clears all of
    /// them — ethernet is never itself sticky).
    pub fn clear_sticky_all(&mut self) {
        self.sticky_deadline.clear();
    }

    /// True iff `device_name`'s sticky deadline is in the future *and* the
    /// caller confirms the device currently has an active connection
    /// (`has_active_connection`) — callers pass this in rather than the
    /// Timeouts collaborator looking up devices itself, keeping this type
    /// free of any NetClient dependency.
    pub fn sticky_active(&self, device_name: &str, has_active_connection: bool) -> bool {
        if !has_active_connection {
            return false;
        }
        match self.sticky_deadline.get(device_name) {
            Some(deadline) => *deadline >= self.now(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fake_clock() -> (impl Fn() -> Instant + Send + Sync, Arc<Mutex<Instant>>) {
        let t = Arc::new(Mutex::new(Instant::now()));
        let t2 = t.clone();
        (move || *t2.lock().unwrap(), t)
    }

    #[test]
    fn retry_not_active_initially() {
        let t = Timeouts::new(DEFAULT_STICKY_PERIOD);
        assert!(!t.retry_active("eth0"));
    }

    #[test]
    fn retry_active_after_arm_then_clears_on_request() {
        let mut t = Timeouts::new(Duration::from_secs(900));
        t.arm_retry("sim1");
        assert!(t.retry_active("sim1"));
        t.clear_retry("sim1");
        assert!(!t.retry_active("sim1"));
    }

    #[test]
    fn sticky_requires_active_connection() {
        let mut t = Timeouts::new(Duration::from_secs(900));
        t.arm_sticky("wwan0");
        assert!(!t.sticky_active("wwan0", false));
        assert!(t.sticky_active("wwan0", true));
    }

    #[test]
    fn clear_sticky_all_drops_everything() {
        let mut t = Timeouts::new(Duration::from_secs(900));
        t.arm_sticky("wwan0");
        t.arm_sticky("wlan0");
        t.clear_sticky_all();
        assert!(!t.sticky_active("wwan0", true));
        assert!(!t.sticky_active("wlan0", true));
    }

    #[test]
    fn retry_expires_with_injected_clock() {
        let (clock, cell) = fake_clock();
        let mut t = Timeouts::with_clock(Duration::from_secs(900), clock);
        t.arm_retry("sim1");
        assert!(t.retry_active("sim1"));
        *cell.lock().unwrap() += RETRY_PERIOD + Duration::from_secs(1);
        assert!(!t.retry_active("sim1"));
    }
}
