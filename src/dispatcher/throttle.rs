//! Global pacing of attempts against the external target

use rand::{Rng, thread_rng};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Enforces a randomized gap between the starts of consecutive attempts,
/// shared by every worker.
#[derive(Debug)]
pub struct Throttle {
    min: Duration,
    max: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
            last_start: Mutex::new(None),
        }
    }

    fn gap(&self) -> Duration {
        if self.max.is_zero() {
            return Duration::ZERO;
        }
        let millis = thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Wait for the gate, then claim the current instant as the latest start.
    ///
    /// The lock is held while sleeping, so waiters pass one at a time.
    pub async fn acquire(&self) -> Duration {
        let mut last_start = self.last_start.lock().await;

        let waited = match *last_start {
            Some(previous) => {
                let ready_at = previous + self.gap();
                let now = Instant::now();
                if ready_at > now {
                    let wait = ready_at - now;
                    debug!(wait_ms = wait.as_millis() as u64, "Throttling next attempt");
                    tokio::time::sleep_until(ready_at).await;
                    wait
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };

        *last_start = Some(Instant::now());
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_is_free() {
        let throttle = Throttle::new(Duration::from_secs(3), Duration::from_secs(8));
        assert_eq!(throttle.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_starts_are_spaced() {
        let throttle = Throttle::new(Duration::from_secs(3), Duration::from_secs(8));

        let first = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        let gap = Instant::now() - first;

        assert!(gap >= Duration::from_secs(3), "gap was {:?}", gap);
        assert!(gap <= Duration::from_secs(8), "gap was {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_workers_share_the_gate() {
        let throttle = Arc::new(Throttle::new(Duration::from_secs(2), Duration::from_secs(2)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move {
                throttle.acquire().await;
                Instant::now()
            }));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap() - start);
        }
        starts.sort();

        assert_eq!(starts[0], Duration::ZERO);
        assert!(starts[1] >= Duration::from_secs(2));
        assert!(starts[2] >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_zero_window_never_waits() {
        let throttle = Throttle::new(Duration::ZERO, Duration::ZERO);
        throttle.acquire().await;
        assert_eq!(throttle.acquire().await, Duration::ZERO);
    }
}
