use rand::Rng;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Generates a random election timeout within `[min_ms, max_ms)`
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = if max_ms > min_ms {
        rng.gen_range(min_ms..max_ms)
    } else {
        min_ms
    };
    Duration::from_millis(timeout_ms)
}

/// Single-shot, resettable election alarm.
///
/// The timer only tracks a deadline; the listener loop awaits [`ElectionTimer::sleep`]
/// inside its `select!` and rebuilds the future each iteration, so a reset
/// takes effect on the next pass through the loop.
#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let deadline = Instant::now() + random_election_timeout(min_ms, max_ms);
        Self {
            min_ms,
            max_ms,
            deadline,
        }
    }

    /// Re-arm with a fresh random duration.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + random_election_timeout(self.min_ms, self.max_ms);
    }

    #[cfg(test)]
    fn deadline(&self) -> Instant {
        self.deadline
    }

    #[cfg(test)]
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn sleep(&self) -> Sleep {
        tokio::time::sleep_until(self.deadline)
    }
}
