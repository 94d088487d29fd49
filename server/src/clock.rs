use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source for the scheduler and handlers.
///
/// Everything that sleeps or reads the wall clock goes through this trait so
/// tests can drive virtual time instead of waiting out real delays.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock backed by the Tokio timer.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests: sleeping advances virtual time instantly
/// and every sleep is recorded for assertions on pacing behavior.
///
/// A park threshold makes sleeps longer than it block forever instead; that
/// keeps short pacing delays instant while pinning long timer sleeps (the
/// per-alliance re-fire timers) so they can be inspected without firing.
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
    sleeps: parking_lot::Mutex<Vec<Duration>>,
    park_threshold: Option<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
            sleeps: parking_lot::Mutex::new(Vec::new()),
            park_threshold: None,
        }
    }

    pub fn with_park_threshold(start: DateTime<Utc>, threshold: Duration) -> Self {
        Self {
            park_threshold: Some(threshold),
            ..Self::new(start)
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        if let Some(threshold) = self.park_threshold {
            if duration > threshold {
                std::future::pending::<()>().await;
            }
        }
        self.sleeps.lock().push(duration);
        self.advance(duration);
        // Yield so concurrent tasks interleave the way they would under a
        // real timer.
        tokio::task::yield_now().await;
    }
}
