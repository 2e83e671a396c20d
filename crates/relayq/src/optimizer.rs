//! Polling Optimizer: stretches a subscription's poll interval on misses,
//! resets it on a hit or a wake signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-subscription adaptive polling state. Shared (via `Arc`) across all
/// workers of one subscription, so a hit or miss observed by any worker
/// affects the whole subscription's polling cadence.
pub struct PollingOptimizer {
    base_millis: u64,
    max_millis: u64,
    factor: f64,
    current_millis: AtomicU64,
}

impl PollingOptimizer {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let base_millis = base.as_millis() as u64;
        Self {
            base_millis,
            max_millis: max.as_millis() as u64,
            factor,
            current_millis: AtomicU64::new(base_millis),
        }
    }

    /// A poll found a due message: reset the interval to its base.
    pub fn hit(&self) {
        self.current_millis.store(self.base_millis, Ordering::SeqCst);
    }

    /// A poll found nothing: stretch the interval by `factor`, clamped to
    /// `max`.
    pub fn miss(&self) {
        self.current_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let grown = (current as f64 * self.factor).round() as u64;
                Some(grown.min(self.max_millis).max(self.base_millis))
            })
            .ok();
    }

    /// A wake signal (change notification, or explicit "new message"
    /// event) resets the interval and should short-circuit any pending
    /// sleep — this is what keeps idle queues responsive.
    pub fn wake(&self) {
        self.hit();
    }

    pub fn next_interval(&self) -> Duration {
        Duration::from_millis(self.current_millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_base_interval() {
        let opt = PollingOptimizer::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0);
        assert_eq!(opt.next_interval(), Duration::from_millis(100));
    }

    #[test]
    fn miss_grows_interval_by_factor_and_clamps_to_max() {
        let opt = PollingOptimizer::new(Duration::from_millis(100), Duration::from_millis(350), 2.0);
        opt.miss();
        assert_eq!(opt.next_interval(), Duration::from_millis(200));
        opt.miss();
        assert_eq!(opt.next_interval(), Duration::from_millis(350));
        opt.miss();
        assert_eq!(opt.next_interval(), Duration::from_millis(350));
    }

    #[test]
    fn hit_resets_interval_to_base() {
        let opt = PollingOptimizer::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0);
        opt.miss();
        opt.miss();
        assert!(opt.next_interval() > Duration::from_millis(100));
        opt.hit();
        assert_eq!(opt.next_interval(), Duration::from_millis(100));
    }

    #[test]
    fn wake_behaves_like_a_hit() {
        let opt = PollingOptimizer::new(Duration::from_millis(50), Duration::from_millis(500), 2.0);
        opt.miss();
        opt.wake();
        assert_eq!(opt.next_interval(), Duration::from_millis(50));
    }
}
