use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;

/// Process-global pacer for outbound game-API calls.
///
/// Every handler reserves a slot before issuing a call; slots are spaced
/// `min_gap` apart, so the aggregate request rate stays inside the remote
/// budget no matter how many handlers overlap around a preemption window.
pub struct ApiBudget {
    clock: Arc<dyn Clock>,
    min_gap: Duration,
    next_free: Mutex<Option<DateTime<Utc>>>,
}

impl ApiBudget {
    pub fn new(clock: Arc<dyn Clock>, min_gap: Duration) -> Self {
        Self {
            clock,
            min_gap,
            next_free: Mutex::new(None),
        }
    }

    /// Reserve the next call slot, sleeping until it is available.
    pub async fn acquire(&self) {
        let gap = chrono::Duration::from_std(self.min_gap)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let wait = {
            let mut next_free = self.next_free.lock();
            let now = self.clock.now();
            let slot = match *next_free {
                Some(at) if at > now => at,
                _ => now,
            };
            *next_free = Some(slot + gap);
            (slot - now).to_std().unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            self.clock.sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn first_call_is_immediate() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let budget = ApiBudget::new(clock.clone(), Duration::from_millis(2000));
        budget.acquire().await;
        assert!(clock.recorded_sleeps().is_empty());
    }

    #[tokio::test]
    async fn back_to_back_calls_are_spaced() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let budget = ApiBudget::new(clock.clone(), Duration::from_millis(2000));
        budget.acquire().await;
        budget.acquire().await;
        budget.acquire().await;
        assert_eq!(clock.total_slept(), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn elapsed_gap_means_no_wait() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let budget = ApiBudget::new(clock.clone(), Duration::from_millis(2000));
        budget.acquire().await;
        clock.advance(Duration::from_millis(3000));
        budget.acquire().await;
        assert!(clock.recorded_sleeps().is_empty());
    }
}
