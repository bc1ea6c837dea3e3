//! Randomized inter-send delays

use rand::Rng;
use std::time::Duration;

/// Uniform delay range in milliseconds, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: max_ms.max(min_ms),
        }
    }

    /// Draw one delay
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_ms == self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sample_within_bounds() {
        let range = DelayRange::new(30_000, 90_000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = range.sample(&mut rng);
            assert!(delay >= Duration::from_millis(30_000));
            assert!(delay <= Duration::from_millis(90_000));
        }
    }

    #[test]
    fn test_fixed_and_inverted_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            DelayRange::new(500, 500).sample(&mut rng),
            Duration::from_millis(500)
        );
        let inverted = DelayRange::new(900, 100);
        assert_eq!((inverted.min_ms, inverted.max_ms), (100, 900));
    }
}
