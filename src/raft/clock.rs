//! Injected time and randomness.
//!
//! Timers and election jitter go through these traits so tests can
//! drive role transitions without real sleeps. `SystemClock` defers to
//! `tokio::time`, which `#[tokio::test(start_paused = true)]` controls
//! deterministically.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::time::Instant;

/// Abstraction over the time source used for heartbeats and election
/// timeouts.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, dur: Duration);
}

/// Production clock over `tokio::time`.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Source of randomness for node/cluster identifiers and election
/// jitter.
pub trait RandomSource: Send + Sync {
    fn next_u64(&self) -> u64;
}

/// Production randomness over the thread RNG.
#[derive(Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_u64(&self) -> u64 {
        rand::thread_rng().next_u64()
    }
}

/// Scripted randomness for tests: yields the given values in order,
/// then repeats the last one.
pub struct StepRandom {
    values: std::sync::Mutex<Vec<u64>>,
}

impl StepRandom {
    pub fn new(mut values: Vec<u64>) -> StepRandom {
        values.reverse();
        StepRandom {
            values: std::sync::Mutex::new(values),
        }
    }
}

impl RandomSource for StepRandom {
    fn next_u64(&self) -> u64 {
        let mut values = self.values.lock().unwrap();
        if values.len() > 1 {
            values.pop().unwrap()
        } else {
            *values.last().expect("StepRandom exhausted")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_random_yields_then_repeats() {
        let rand = StepRandom::new(vec![3, 5, 8]);
        assert_eq!(rand.next_u64(), 3);
        assert_eq!(rand.next_u64(), 5);
        assert_eq!(rand.next_u64(), 8);
        assert_eq!(rand.next_u64(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_follows_paused_time() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep(Duration::from_secs(60)).await;
        assert!(clock.now() - before >= Duration::from_secs(60));
    }
}
