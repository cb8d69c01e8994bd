use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for FIFO traffic and backpressure.
///
/// # Example
/// ```rust
/// use ilkit_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.enqueue();
/// assert_eq!(metrics.enqueued(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    sentinels: AtomicU64,
    stalls: AtomicU64,
}

impl Metrics {
    /// Increment the enqueue counter.
    pub fn enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the dequeue counter.
    pub fn dequeue(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the sentinel counter.
    pub fn sentinel(&self) {
        self.sentinels.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the stall counter (a consumer had to block).
    pub fn stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of enqueued items.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Snapshot of dequeued items.
    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Snapshot of injected sentinels.
    pub fn sentinels(&self) -> u64 {
        self.sentinels.load(Ordering::Relaxed)
    }

    /// Snapshot of blocking waits.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

impl Clone for Metrics {
    fn clone(&self) -> Self {
        let cloned = Metrics::default();
        cloned.enqueued.store(self.enqueued(), Ordering::Relaxed);
        cloned.dequeued.store(self.dequeued(), Ordering::Relaxed);
        cloned.sentinels.store(self.sentinels(), Ordering::Relaxed);
        cloned.stalls.store(self.stalls(), Ordering::Relaxed);
        cloned
    }
}
