use std::cmp::{max, min};
use std::time::Duration;

/// Delays between retries, growing by a factor after every failure up to a maximum, and back to
///  the initial delay after a success
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::with_factor_eighths(initial_delay, max_delay, 8*2)
    }

    pub fn with_factor_eighths(initial_delay: Duration, max_delay: Duration, factor_eighths: u32) -> Self {
        assert!(factor_eighths >= 8);

        ExponentialBackoff {
            next_delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max(initial_delay, max_delay),
            config_factor_eighths: factor_eighths,
        }
    }

    /// the delay before the next attempt after a failure
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(self.next_delay * self.config_factor_eighths / 8, self.config_max_delay);
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.config_initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn millis(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[rstest]
    #[case::initial(100, 1000, 16, 1, vec![100])]
    #[case::doubling(100, 1000, 16, 4, vec![100, 200, 400, 800])]
    #[case::capped(100, 1000, 16, 6, vec![100, 200, 400, 800, 1000, 1000])]
    #[case::factor_1_5(100, 1000, 12, 4, vec![100, 150, 225, 337])]
    #[case::constant(100, 1000, 8, 3, vec![100, 100, 100])]
    #[case::max_below_initial(100, 50, 16, 2, vec![100, 100])]
    fn test_next_delay(#[case] initial: u64, #[case] max: u64, #[case] factor: u32, #[case] num_calls: usize, #[case] expected: Vec<u64>) {
        let mut backoff = ExponentialBackoff::with_factor_eighths(millis(initial), millis(max), factor);
        let actual = (0..num_calls)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(millis(100), millis(1000));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), millis(100));
    }
}
