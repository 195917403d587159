//! Delay schedule for transaction commit retries.

use std::time::Duration;

use rand::Rng;

/// Capped doubling with full jitter. The schedule carries the cap the next
/// delay will be drawn under; each draw doubles the cap up to the ceiling
/// and returns a uniform duration below the old cap, so transactions that
/// conflicted once do not retry in lockstep and conflict again.
pub struct RetrySchedule {
    cap: Duration,
    ceiling: Duration,
}

impl RetrySchedule {
    pub fn new(first_cap: Duration, ceiling: Duration) -> Self {
        Self {
            cap: first_cap.min(ceiling),
            ceiling,
        }
    }

    /// The bound the next [`RetrySchedule::next_delay`] draw stays under.
    pub fn current_cap(&self) -> Duration {
        self.cap
    }

    /// Draw the next delay and advance the schedule.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let cap = self.cap;
        self.cap = match cap.checked_mul(2) {
            Some(doubled) => doubled.min(self.ceiling),
            None => self.ceiling,
        };
        cap.mul_f64(rng.random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetrySchedule;

    #[test]
    fn test_caps_double_up_to_ceiling_and_bound_delays() {
        let mut schedule =
            RetrySchedule::new(Duration::from_millis(8), Duration::from_millis(100));
        let mut rng = rand::rng();
        let mut caps = Vec::new();
        for _ in 0..6 {
            let cap = schedule.current_cap();
            let delay = schedule.next_delay(&mut rng);
            assert!(delay <= cap, "delay {delay:?} drawn above its cap {cap:?}");
            caps.push(cap);
        }
        // Pre-jitter caps grow geometrically until the ceiling, then hold.
        let expected: Vec<Duration> = [8u64, 16, 32, 64, 100, 100]
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        assert_eq!(caps, expected);
    }

    #[test]
    fn test_first_cap_clamped_to_ceiling() {
        let mut schedule =
            RetrySchedule::new(Duration::from_secs(5), Duration::from_millis(100));
        assert_eq!(schedule.current_cap(), Duration::from_millis(100));
        let delay = schedule.next_delay(&mut rand::rng());
        assert!(delay <= Duration::from_millis(100));
    }
}
