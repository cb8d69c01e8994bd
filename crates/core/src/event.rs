use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Result of waiting on an [`EventQueue`].
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use ilkit_core::prelude::{EventQueue, WaitOutcome};
///
/// let queue = EventQueue::<u8>::new();
/// assert!(matches!(queue.wait(Duration::ZERO), WaitOutcome::Timeout));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<E> {
    /// An event arrived in time.
    Event(E),
    /// The deadline elapsed first.
    Timeout,
}

impl<E> WaitOutcome<E> {
    /// Convert into an `Option`, mapping a timeout to `None`.
    pub fn event(self) -> Option<E> {
        match self {
            WaitOutcome::Event(event) => Some(event),
            WaitOutcome::Timeout => None,
        }
    }

    /// Whether the wait timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitOutcome::Timeout)
    }
}

/// FIFO of protocol events posted from arbitrary threads and consumed by one control thread.
///
/// Posting never blocks beyond the push itself, so it is safe to call from a native
/// callback thread.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use ilkit_core::prelude::{EventQueue, WaitOutcome};
///
/// let queue = EventQueue::new();
/// queue.post("idle");
/// queue.post("executing");
/// let hit = queue.wait_for(|e| *e == "executing", Duration::from_millis(10));
/// assert_eq!(hit, WaitOutcome::Event("executing"));
/// assert_eq!(queue.discarded(), 1);
/// ```
pub struct EventQueue<E> {
    events: Mutex<VecDeque<E>>,
    ready: Condvar,
    discarded: AtomicU64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            discarded: AtomicU64::new(0),
        }
    }
}

impl<E> EventQueue<E> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake the waiter.
    pub fn post(&self, event: E) {
        self.events.lock().push_back(event);
        self.ready.notify_one();
    }

    /// Pop the oldest event without blocking.
    pub fn try_next(&self) -> Option<E> {
        self.events.lock().pop_front()
    }

    /// Wait up to `timeout` for the next event.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome<E> {
        self.wait_for(|_| true, timeout)
    }

    /// Wait for the first event matching `predicate`, discarding the others.
    ///
    /// `timeout` is a single deadline shared by every retry, so a steady stream of
    /// non-matching events cannot extend the wait. The predicate runs under the queue lock
    /// and must not block.
    pub fn wait_for<F>(&self, mut predicate: F, timeout: Duration) -> WaitOutcome<E>
    where
        F: FnMut(&E) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            while let Some(event) = events.pop_front() {
                if predicate(&event) {
                    return WaitOutcome::Event(event);
                }
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
            if self.ready.wait_until(&mut events, deadline).timed_out() && events.is_empty() {
                return WaitOutcome::Timeout;
            }
        }
    }

    /// Drop every pending event, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let n = events.len();
        events.clear();
        n
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events thrown away by [`EventQueue::wait_for`] so far.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl<E> std::fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.len())
            .field("discarded", &self.discarded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[test]
    fn events_from_different_threads_keep_post_order() {
        let queue = Arc::new(EventQueue::new());
        for (i, name) in ["o1", "o2", "o3"].into_iter().enumerate() {
            let queue = queue.clone();
            // Each poster finishes before the next one starts, fixing the post order.
            thread::spawn(move || queue.post((i, name))).join().unwrap();
        }
        let seen: Vec<_> = (0..3)
            .map(|_| queue.wait(Duration::from_millis(50)).event().unwrap())
            .collect();
        assert_eq!(seen, vec![(0, "o1"), (1, "o2"), (2, "o3")]);
    }

    #[test]
    fn wait_for_uses_one_deadline_across_retries() {
        let queue = Arc::new(EventQueue::new());
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let start_line = Arc::new(Barrier::new(2));
        let noise = {
            let queue = queue.clone();
            let stop = stop.clone();
            let start_line = start_line.clone();
            thread::spawn(move || {
                start_line.wait();
                while !stop.load(Ordering::Relaxed) {
                    queue.post(0u32);
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };
        start_line.wait();
        let start = Instant::now();
        let outcome = queue.wait_for(|e| *e == 1, Duration::from_millis(60));
        let waited = start.elapsed();
        stop.store(true, Ordering::Relaxed);
        noise.join().unwrap();
        assert!(outcome.is_timeout());
        assert!(waited >= Duration::from_millis(60));
        assert!(waited < Duration::from_secs(2));
        assert!(queue.discarded() > 0);
    }

    #[test]
    fn wait_wakes_when_event_posted_later() {
        let queue = Arc::new(EventQueue::new());
        let poster = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                queue.post(42u8);
            })
        };
        assert_eq!(queue.wait(Duration::from_secs(5)), WaitOutcome::Event(42));
        poster.join().unwrap();
    }

    #[test]
    fn matching_event_is_returned_and_later_events_kept() {
        let queue = EventQueue::new();
        queue.post(1);
        queue.post(2);
        queue.post(3);
        assert_eq!(
            queue.wait_for(|e| *e == 2, Duration::ZERO),
            WaitOutcome::Event(2)
        );
        assert_eq!(queue.try_next(), Some(3));
        assert_eq!(queue.discarded(), 1);
    }
}
