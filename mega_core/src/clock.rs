//! Monotonic decisecond clock and exponential backoff timers.
//!
//! The whole engine runs on a single monotonic clock measured in
//! deciseconds (tenths of a second). Every retryable subsystem owns a
//! [`BackoffTimer`]; the main loop computes the minimum next-fire instant
//! across all live timers each iteration to bound its `wait()`.

use std::time::Instant;

use rand::Rng;
use rand::rngs::StdRng;

/// Decisecond tick count.
pub type Ds = u32;

/// The maximum representable instant; a timer at `NEVER` does not fire.
pub const NEVER: Ds = Ds::MAX;

/// Backoff growth cap: one hour.
const MAX_DELAY_DS: Ds = 36000;

/// Source of monotonic decisecond time. An explicit offset supports
/// simulated time in harnesses without a trait indirection.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
    offset: Ds,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
            offset: 0,
        }
    }

    pub fn now_ds(&self) -> Ds {
        (self.origin.elapsed().as_millis() / 100) as Ds + self.offset
    }

    /// Jumps the clock forward; time never goes back.
    pub fn advance(&mut self, ds: Ds) {
        self.offset = self.offset.saturating_add(ds);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential retry schedule with armed/next-fire semantics.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    next: Ds,
    delta: Ds,
}

impl BackoffTimer {
    /// A fresh timer never fires.
    pub fn new() -> Self {
        BackoffTimer {
            next: NEVER,
            delta: 0,
        }
    }

    /// Schedules the next fire `delay` deciseconds from `now` and makes
    /// that delay the base for subsequent exponential growth.
    pub fn backoff_for(&mut self, now: Ds, delay: Ds) {
        self.next = now.saturating_add(delay);
        self.delta = delay;
    }

    /// Grows the current delay exponentially, capped, with jitter drawn
    /// from the client PRNG so that retry herds spread out.
    pub fn backoff(&mut self, now: Ds, rng: &mut StdRng) {
        let base = if self.delta == 0 { 1 } else { self.delta };
        let grown = base.saturating_mul(2).min(MAX_DELAY_DS);
        // up to half the delay of jitter, subtracted
        let jitter = if grown > 1 {
            rng.random_range(0..grown / 2 + 1)
        } else {
            0
        };
        self.delta = grown;
        self.next = now.saturating_add(grown - jitter);
    }

    /// Forces the timer to fire immediately.
    pub fn arm(&mut self, now: Ds) {
        self.next = now;
    }

    /// True once the fire instant has been reached.
    pub fn armed(&self, now: Ds) -> bool {
        now >= self.next
    }

    /// Disarms the timer and clears the growth state.
    pub fn reset(&mut self) {
        self.next = NEVER;
        self.delta = 0;
    }

    pub fn next_fire(&self) -> Ds {
        self.next
    }

    /// Deciseconds until the next fire, zero if already armed.
    pub fn retry_in(&self, now: Ds) -> Ds {
        self.next.saturating_sub(now)
    }

    /// Folds this timer's deadline into a loop-wide minimum.
    pub fn update_min(&self, min: &mut Ds) {
        if self.next < *min {
            *min = self.next;
        }
    }
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_fresh_timer_never_fires() {
        let bt = BackoffTimer::new();
        assert!(!bt.armed(0));
        assert!(!bt.armed(NEVER - 1));
        assert_eq!(bt.next_fire(), NEVER);
    }

    #[test]
    fn test_backoff_for_and_arm() {
        let mut bt = BackoffTimer::new();
        bt.backoff_for(100, 50);
        assert!(!bt.armed(149));
        assert!(bt.armed(150));
        bt.arm(120);
        assert!(bt.armed(120));
    }

    #[test]
    fn test_backoff_monotonic_growth() {
        let mut bt = BackoffTimer::new();
        let mut r = rng();
        let mut prev = 0;
        for _ in 0..32 {
            bt.backoff(0, &mut r);
            assert!(bt.delta >= prev, "delay must not shrink");
            assert!(bt.delta <= MAX_DELAY_DS);
            prev = bt.delta;
        }
        assert_eq!(prev, MAX_DELAY_DS);
    }

    #[test]
    fn test_reset_clears_growth() {
        let mut bt = BackoffTimer::new();
        let mut r = rng();
        bt.backoff(0, &mut r);
        bt.backoff(0, &mut r);
        bt.reset();
        assert_eq!(bt.next_fire(), NEVER);
        bt.backoff(0, &mut r);
        assert_eq!(bt.delta, 2);
    }

    #[test]
    fn test_update_min() {
        let mut bt = BackoffTimer::new();
        bt.backoff_for(0, 30);
        let mut min = NEVER;
        bt.update_min(&mut min);
        assert_eq!(min, 30);
    }
}
