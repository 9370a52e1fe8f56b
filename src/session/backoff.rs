//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Reconnect delay generator: `min(base * factor^attempts, max)`, with an
/// optional random deviation of up to `jitter * delay` added or subtracted.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(100),
            Duration::from_millis(10_000),
            2.0,
            0.0,
        )
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            min,
            max,
            factor,
            // out-of-range jitter disables it
            jitter: if jitter > 0.0 && jitter <= 1.0 {
                jitter
            } else {
                0.0
            },
            attempts: 0,
        }
    }

    /// The next delay; increments the attempt counter.
    pub fn duration(&mut self) -> Duration {
        let mut ms = self.min.as_millis() as f64 * self.factor.powi(self.attempts as i32);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter > 0.0 {
            let rand: f64 = rand::rng().random();
            let deviation = (rand * self.jitter * ms).floor();
            ms = if ((rand * 10.0).floor() as u64) & 1 == 0 {
                ms - deviation
            } else {
                ms + deviation
            };
        }

        let capped = ms.min(self.max.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn set_min(&mut self, min: Duration) {
        self.min = min;
    }

    pub fn set_max(&mut self, max: Duration) {
        self.max = max;
    }

    pub fn set_jitter(&mut self, jitter: f64) {
        self.jitter = if jitter > 0.0 && jitter <= 1.0 {
            jitter
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_ceiling() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            2.0,
            0.0,
        );
        let delays: Vec<u64> = (0..5).map(|_| backoff.duration().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            2.0,
            0.0,
        );
        backoff.duration();
        backoff.duration();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.duration().as_millis(), 1000);
    }

    #[test]
    fn jitter_stays_within_the_deviation_band() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(10_000),
            2.0,
            0.5,
        );
        for _ in 0..100 {
            backoff.reset();
            let ms = backoff.duration().as_millis() as f64;
            assert!((500.0..=1500.0).contains(&ms), "delay {ms} out of band");
        }
    }

    #[test]
    fn invalid_jitter_is_ignored() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            2.0,
            4.2,
        );
        assert_eq!(backoff.duration().as_millis(), 1000);
    }
}
