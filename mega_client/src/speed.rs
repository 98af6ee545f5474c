//! Rolling per-direction throughput, feeding the dispatch lookahead rule.

use std::collections::VecDeque;

use mega_core::Ds;

/// Window length for the rolling average.
const WINDOW_DS: Ds = 100; // 10 seconds

#[derive(Debug, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Ds, u64)>,
    total: u64,
}

impl SpeedMeter {
    pub fn new() -> SpeedMeter {
        SpeedMeter::default()
    }

    pub fn record(&mut self, now: Ds, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Ds) {
        while let Some((ts, bytes)) = self.samples.front().copied() {
            if now.saturating_sub(ts) <= WINDOW_DS {
                break;
            }
            self.total -= bytes;
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the window.
    pub fn bytes_per_second(&mut self, now: Ds) -> u64 {
        self.evict(now);
        if self.samples.is_empty() {
            return 0;
        }
        self.total * 10 / u64::from(WINDOW_DS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_window() {
        let mut meter = SpeedMeter::new();
        meter.record(0, 1000);
        meter.record(50, 1000);
        // 2000 bytes over a 10s window -> 200 B/s
        assert_eq!(meter.bytes_per_second(50), 200);
        // first sample falls out of the window
        assert_eq!(meter.bytes_per_second(151), 100);
        assert_eq!(meter.bytes_per_second(300), 0);
    }
}
