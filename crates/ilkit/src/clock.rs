/// Timestamps audio output from the number of samples produced.
///
/// Components stamp decoded audio unreliably; the clock re-bases on every non-zero
/// timestamp that disagrees with its own count and otherwise advances by sample count.
///
/// # Example
/// ```rust
/// use ilkit::SampleClock;
///
/// let mut clock = SampleClock::new(48_000);
/// assert_eq!(clock.stamp(1_000_000, 480), 1_000_000);
/// // The component repeats a stale timestamp; the count wins.
/// assert_eq!(clock.stamp(0, 480), 1_010_000);
/// assert_eq!(clock.stamp(1_020_000, 480), 1_020_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleClock {
    rate: u32,
    base: Option<i64>,
    samples: u64,
}

impl SampleClock {
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            base: None,
            samples: 0,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Current position in microseconds, if the clock was ever set.
    pub fn now(&self) -> Option<i64> {
        let elapsed = (u128::from(self.samples) * 1_000_000 / u128::from(self.rate)) as i64;
        self.base.map(|base| base + elapsed)
    }

    /// Restart counting from `timestamp`.
    pub fn set(&mut self, timestamp: i64) {
        self.base = Some(timestamp);
        self.samples = 0;
    }

    /// Forget the position; the next stamped timestamp re-bases the clock.
    pub fn reset(&mut self) {
        self.base = None;
        self.samples = 0;
    }

    /// Timestamp for a block of `samples` samples the component stamped `native`.
    pub fn stamp(&mut self, native: i64, samples: u64) -> i64 {
        if native != 0 && self.now() != Some(native) {
            self.set(native);
        }
        let pts = self.now().unwrap_or(0);
        if self.base.is_none() {
            self.base = Some(0);
        }
        self.samples += samples;
        pts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstamped_stream_counts_from_zero() {
        let mut clock = SampleClock::new(8_000);
        assert_eq!(clock.stamp(0, 80), 0);
        assert_eq!(clock.stamp(0, 80), 10_000);
        clock.reset();
        assert_eq!(clock.now(), None);
        assert_eq!(clock.stamp(500, 8), 500);
        assert_eq!(clock.now(), Some(1_500));
    }

    #[test]
    fn fractional_rates_do_not_drift() {
        let mut clock = SampleClock::new(44_100);
        clock.set(0);
        for _ in 0..44_100 / 441 {
            clock.stamp(0, 441);
        }
        assert_eq!(clock.now(), Some(1_000_000));
    }
}
