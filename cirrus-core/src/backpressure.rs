//! Backpressure: `RateLimiter`
//!
//! Byte-based admission control for the outbound event path.
//!
//! Design principle:
//! - Backpressure scales with **bytes**, not event count
//! - Charges are rounded up to the transport block size, with a minimum of
//!   one block, so many tiny events cannot starve large ones
//! - Publish attempts are rejected synchronously when the outbound queue is
//!   saturated instead of queueing unboundedly
//!
//! Usage:
//! ```rust,ignore
//! if limiter.take(size) {
//!     // ... hand the message to the transport ...
//!     // exactly one matching give(size) once the request completes
//!     limiter.give(size);
//! }
//! ```

use parking_lot::Mutex;
use tracing::warn;

/// Transport block size; the admission rounding unit.
pub const BLOCK_SIZE: usize = 1024;

/// Default budget for total in-flight outbound payload bytes.
pub const MAX_DATA_IN_FLIGHT: usize = 32 * 1024;

/// Admission-control gate bounding total in-flight outbound payload bytes.
#[derive(Debug)]
pub struct RateLimiter {
    in_flight: Mutex<i64>,
    budget: usize,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MAX_DATA_IN_FLIGHT)
    }
}

impl RateLimiter {
    /// Create a limiter with the given byte budget.
    #[must_use]
    pub const fn new(budget: usize) -> Self {
        Self {
            in_flight: Mutex::new(0),
            budget,
        }
    }

    /// Reserve capacity for `size` payload bytes.
    ///
    /// The charge is `size` rounded up to [`BLOCK_SIZE`], minimum one block.
    /// Returns `false` without reserving anything when the budget would be
    /// exceeded.
    pub fn take(&self, size: usize) -> bool {
        let charge = size_in_full_blocks(size);
        let mut in_flight = self.in_flight.lock();
        if *in_flight + charge as i64 > self.budget as i64 {
            return false;
        }
        *in_flight += charge as i64;
        true
    }

    /// Read-only probe: would `take(size)` succeed right now?
    #[must_use]
    pub fn can_take(&self, size: usize) -> bool {
        let in_flight = self.in_flight.lock();
        *in_flight + size_in_full_blocks(size) as i64 <= self.budget as i64
    }

    /// Release a reservation made by a successful `take`.
    ///
    /// Callers must give exactly once per successful take, with the size
    /// charged at take time. Underflow indicates a bookkeeping bug; it is
    /// clamped to zero rather than crashing.
    pub fn give(&self, size: usize) {
        let charge = size_in_full_blocks(size);
        let mut in_flight = self.in_flight.lock();
        *in_flight -= charge as i64;
        if *in_flight < 0 {
            warn!("Rate limiter underflow; clamping to 0");
            *in_flight = 0;
        }
    }

    /// Current in-flight charge in bytes.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let in_flight = self.in_flight.lock();
        *in_flight as usize
    }
}

/// Round `size` up to whole blocks, minimum one block.
fn size_in_full_blocks(size: usize) -> usize {
    (size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE).max(BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_full_blocks() {
        assert_eq!(size_in_full_blocks(0), BLOCK_SIZE);
        assert_eq!(size_in_full_blocks(1), BLOCK_SIZE);
        assert_eq!(size_in_full_blocks(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(size_in_full_blocks(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
    }

    #[test]
    fn take_and_give_are_exact() {
        let limiter = RateLimiter::new(MAX_DATA_IN_FLIGHT);
        assert!(limiter.take(10));
        assert!(limiter.take(BLOCK_SIZE + 1));
        assert_eq!(limiter.in_flight(), 3 * BLOCK_SIZE);

        limiter.give(10);
        limiter.give(BLOCK_SIZE + 1);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn take_rejects_when_saturated() {
        let limiter = RateLimiter::new(2 * BLOCK_SIZE);
        assert!(limiter.take(BLOCK_SIZE));
        assert!(limiter.take(1));
        assert!(!limiter.take(1));
        assert_eq!(limiter.in_flight(), 2 * BLOCK_SIZE);

        limiter.give(1);
        assert!(limiter.take(1));
    }

    #[test]
    fn can_take_is_side_effect_free() {
        let limiter = RateLimiter::new(2 * BLOCK_SIZE);
        assert!(limiter.can_take(2 * BLOCK_SIZE));
        assert_eq!(limiter.in_flight(), 0);
        assert!(!limiter.can_take(2 * BLOCK_SIZE + 1));
    }

    #[test]
    fn zero_size_still_charges_one_block() {
        let limiter = RateLimiter::new(BLOCK_SIZE);
        assert!(limiter.take(0));
        assert_eq!(limiter.in_flight(), BLOCK_SIZE);
        assert!(!limiter.take(0));
        limiter.give(0);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn give_clamps_underflow() {
        let limiter = RateLimiter::new(MAX_DATA_IN_FLIGHT);
        assert!(limiter.take(10));
        limiter.give(10);
        limiter.give(10); // double give must not underflow
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.take(10));
    }

    #[test]
    fn sub_block_payload_saturation() {
        // budget - B/2 in flight, payload needing 2 full blocks -> refused
        let limiter = RateLimiter::new(4 * BLOCK_SIZE);
        assert!(limiter.take(3 * BLOCK_SIZE + BLOCK_SIZE / 2));
        let before = limiter.in_flight();
        assert!(!limiter.take(BLOCK_SIZE + 1));
        assert_eq!(limiter.in_flight(), before);
    }
}
