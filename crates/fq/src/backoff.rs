//! Reconnect delay policy for the client driver.
//!
//! When an established broker connection drops, immediate reconnection
//! can hammer a broker that is still coming back. The driver instead
//! waits a doubling delay between attempts, capped at a maximum, and
//! resets to the initial delay once a connection succeeds. There is no
//! attempt ceiling: a broker connection is expected to live for the
//! process lifetime, so the driver keeps trying until cancelled.

use std::time::Duration;

/// Capped exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances
    /// the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    /// Resets the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 1s initial, 30s cap. Most broker restarts recover within a few
    /// doublings.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
