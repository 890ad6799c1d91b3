//! Bounded back-off throttling, used to temporarily disable channel
//! consumption when sink errors occur:
//!
//! ```text
//! if !throttle.active() {
//!     match consumer.consume(&mut channel, &path, None) {
//!         Ok(_) => throttle.reset(),
//!         Err(_) => {
//!             let duration = throttle.engage();
//!             // sleep and retry after `duration`
//!         }
//!     }
//! }
//! ```

use std::cmp;
use std::time::{Duration, Instant};

/// A back-off gate. Each `engage` extends the active window and grows the
/// next one, bounded by `cap`.
#[derive(Clone, Debug)]
pub struct Throttle {
    duration: Duration,
    backoff: u32,
    cap: Duration,
    count: u32,
    expires_at: Option<Instant>,
}

impl Throttle {
    /// Make a throttle with a base `duration`, a `backoff` growth factor
    /// and a `cap` on any single window.
    pub fn new(duration: Duration, backoff: u32, cap: Duration) -> Throttle {
        Throttle {
            duration: duration,
            backoff: backoff,
            cap: cap,
            count: 0,
            expires_at: None,
        }
    }

    /// Clear the active window and the growth count.
    pub fn reset(&mut self) {
        self.count = 0;
        self.expires_at = None;
    }

    /// True while an engaged window has not yet expired. A window found
    /// to be expired is cleared on the way out.
    pub fn active(&mut self) -> bool {
        match self.expires_at {
            None => false,
            Some(at) => {
                if at <= Instant::now() {
                    self.expires_at = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Time left in the active window, if any.
    pub fn remaining(&mut self) -> Option<Duration> {
        if !self.active() {
            return None;
        }
        self.expires_at.map(|at| {
            let now = Instant::now();
            if at > now {
                at - now
            } else {
                Duration::from_secs(0)
            }
        })
    }

    /// Open a new active window of `min(cap, duration + duration *
    /// backoff * count)` and grow the count. Returns the window's length.
    pub fn engage(&mut self) -> Duration {
        let growth = self
            .duration
            .checked_mul(self.backoff.saturating_mul(self.count))
            .unwrap_or(self.cap);
        let duration = cmp::min(
            self.cap,
            self.duration.checked_add(growth).unwrap_or(self.cap),
        );
        self.expires_at = Some(Instant::now() + duration);
        self.count += 1;
        duration
    }
}
