//! Injectable wall clock
//!
//! The original system fetched "now" from the downstream database to stay in
//! its time zone; here every component that needs wall time takes a Clock
//! handle instead, and tests pin it with ManualClock.

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current epoch second.
pub trait Clock: Send + Sync {
    fn epoch(&self) -> i64;
}

/// System UTC clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for tests; set or advance it explicitly.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch: i64) -> Self {
        Self {
            now: AtomicI64::new(epoch),
        }
    }

    pub fn set(&self, epoch: i64) {
        self.now.store(epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn epoch(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_700_000_000);
        assert_eq!(clock.epoch(), 1_700_000_000);
        clock.advance(90);
        assert_eq!(clock.epoch(), 1_700_000_090);
        clock.set(42);
        assert_eq!(clock.epoch(), 42);
    }
}
