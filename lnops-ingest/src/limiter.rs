use std::time::Duration;

use tokio::time::{self, Instant};
use triggered::Listener;

/// Admits at most one operation per period.
///
/// The first admission is immediate. Each later admission waits until at
/// least one period has passed since the previous one; idle time is not
/// banked, so there are never bursts.
pub struct AdmissionLimiter {
    period: Duration,
    last: Option<Instant>,
}

impl AdmissionLimiter {
    pub fn new(period: Duration) -> Self {
        AdmissionLimiter { period: period.max(Duration::from_millis(1)), last: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    async fn next_slot(&mut self) {
        if let Some(last) = self.last {
            time::sleep_until(last + self.period).await;
        }
        self.last = Some(Instant::now());
    }

    /// Wait for the next slot, unless shutdown is signalled first.
    ///
    /// Returns false on shutdown.
    pub async fn admit(&mut self, shutdown_signal: &Listener) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_signal.clone() => false,
            _ = self.next_slot() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paces_admissions_test() {
        let (_trigger, listener) = triggered::trigger();
        let mut limiter = AdmissionLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(limiter.admit(&listener).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        let mut last = Instant::now();
        for _ in 0..3 {
            assert!(limiter.admit(&listener).await);
            assert!(last.elapsed() >= Duration::from_secs(1));
            last = Instant::now();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_burst_after_idle_test() {
        let (_trigger, listener) = triggered::trigger();
        let mut limiter = AdmissionLimiter::new(Duration::from_secs(1));
        limiter.admit(&listener).await;
        time::sleep(Duration::from_secs(10)).await;
        // a missed slot is admitted at once, the next one waits a full period
        let idle_admitted = Instant::now();
        limiter.admit(&listener).await;
        assert_eq!(idle_admitted.elapsed(), Duration::ZERO);
        let last = Instant::now();
        limiter.admit(&listener).await;
        assert!(last.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slightly_late_admission_keeps_spacing_test() {
        let (_trigger, listener) = triggered::trigger();
        let mut limiter = AdmissionLimiter::new(Duration::from_secs(1));
        limiter.admit(&listener).await;
        time::sleep(Duration::from_millis(1_004)).await;
        limiter.admit(&listener).await;
        let late = Instant::now();
        limiter.admit(&listener).await;
        assert!(late.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn admit_observes_shutdown_test() {
        let (trigger, listener) = triggered::trigger();
        let mut limiter = AdmissionLimiter::new(Duration::from_secs(3600));
        assert!(limiter.admit(&listener).await);
        trigger.trigger();
        assert!(!limiter.admit(&listener).await);
    }

    #[test]
    fn zero_period_is_clamped_test() {
        let limiter = AdmissionLimiter::new(Duration::ZERO);
        assert_eq!(limiter.period(), Duration::from_millis(1));
    }
}
