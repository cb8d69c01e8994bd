use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    buffer::{BufferFlags, BufferHeader, BufferId},
    metrics::Metrics,
};

/// Item stored in a [`BufferFifo`].
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{BufferFifo, FifoItem};
///
/// let fifo = BufferFifo::new();
/// fifo.put_sentinel();
/// assert!(matches!(fifo.get(), FifoItem::Sentinel));
/// ```
#[derive(Debug)]
pub enum FifoItem {
    /// A real buffer handle.
    Buffer(BufferHeader),
    /// Out-of-band marker: stop consuming and look at the port flags.
    Sentinel,
}

impl FifoItem {
    /// Unwrap the buffer, discarding a sentinel.
    pub fn into_buffer(self) -> Option<BufferHeader> {
        match self {
            FifoItem::Buffer(header) => Some(header),
            FifoItem::Sentinel => None,
        }
    }

    /// Whether this item is the sentinel marker.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, FifoItem::Sentinel)
    }
}

/// Non-blocking view of the head of a [`BufferFifo`].
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{BufferFifo, BufferHeader, BufferId, Peeked};
///
/// let fifo = BufferFifo::new();
/// assert_eq!(fifo.try_peek(), None);
/// fifo.put(BufferHeader::new(BufferId(2), 0, 8)).unwrap();
/// assert!(matches!(fifo.try_peek(), Some(Peeked::Buffer { id: BufferId(2), .. })));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeked {
    /// Head is a buffer handle.
    Buffer {
        id: BufferId,
        filled_len: usize,
        timestamp: i64,
        flags: BufferFlags,
    },
    /// Head is a sentinel.
    Sentinel,
}

/// Errors from [`BufferFifo::put`].
#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    /// The handle is already queued; it is handed back so it is not lost.
    #[error("buffer {} is already queued", .0.id())]
    AlreadyQueued(BufferHeader),
}

impl FifoError {
    /// Recover the rejected handle.
    pub fn into_inner(self) -> BufferHeader {
        match self {
            FifoError::AlreadyQueued(header) => header,
        }
    }
}

/// Blocking FIFO of buffer handles shared by the control thread and callback threads.
///
/// `put` wakes one waiter; `get` blocks until an item is available. Critical sections
/// cover only the queue operation itself.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{BufferFifo, BufferHeader, BufferId, FifoItem};
///
/// let fifo = BufferFifo::new();
/// fifo.put(BufferHeader::new(BufferId(0), 0, 4)).unwrap();
/// fifo.put(BufferHeader::new(BufferId(1), 0, 4)).unwrap();
/// let first = fifo.get().into_buffer().unwrap();
/// assert_eq!(first.id(), BufferId(0));
/// ```
#[derive(Default)]
pub struct BufferFifo {
    state: Mutex<FifoState>,
    ready: Condvar,
    metrics: Metrics,
}

#[derive(Default)]
struct FifoState {
    items: VecDeque<FifoItem>,
    queued: HashSet<BufferId>,
}

impl FifoState {
    fn pop(&mut self) -> Option<FifoItem> {
        let item = self.items.pop_front()?;
        if let FifoItem::Buffer(header) = &item {
            self.queued.remove(&header.id());
        }
        Some(item)
    }
}

impl BufferFifo {
    /// Create an empty FIFO.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handle and wake one waiter.
    ///
    /// A handle whose id is already queued is rejected.
    pub fn put(&self, header: BufferHeader) -> Result<(), FifoError> {
        {
            let mut state = self.state.lock();
            if !state.queued.insert(header.id()) {
                return Err(FifoError::AlreadyQueued(header));
            }
            state.items.push_back(FifoItem::Buffer(header));
        }
        self.metrics.enqueue();
        self.ready.notify_one();
        Ok(())
    }

    /// Append a sentinel behind everything already queued and wake one waiter.
    pub fn put_sentinel(&self) {
        self.state.lock().items.push_back(FifoItem::Sentinel);
        self.metrics.sentinel();
        self.ready.notify_one();
    }

    /// Remove the head, blocking until one is available.
    pub fn get(&self) -> FifoItem {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.pop() {
                drop(state);
                self.metrics.dequeue();
                return item;
            }
            self.metrics.stall();
            self.ready.wait(&mut state);
        }
    }

    /// Remove the head, blocking for at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<FifoItem> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.pop() {
                drop(state);
                self.metrics.dequeue();
                return Some(item);
            }
            self.metrics.stall();
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                let item = state.pop();
                drop(state);
                if item.is_some() {
                    self.metrics.dequeue();
                }
                return item;
            }
        }
    }

    /// Remove the head without blocking.
    pub fn try_get(&self) -> Option<FifoItem> {
        let item = self.state.lock().pop();
        if item.is_some() {
            self.metrics.dequeue();
        }
        item
    }

    /// Inspect the head without removing it.
    pub fn try_peek(&self) -> Option<Peeked> {
        let state = self.state.lock();
        state.items.front().map(|item| match item {
            FifoItem::Buffer(header) => Peeked::Buffer {
                id: header.id(),
                filled_len: header.filled_len(),
                timestamp: header.timestamp,
                flags: header.flags,
            },
            FifoItem::Sentinel => Peeked::Sentinel,
        })
    }

    /// Take every queued item in order.
    pub fn drain(&self) -> Vec<FifoItem> {
        let mut state = self.state.lock();
        state.queued.clear();
        let items: Vec<FifoItem> = state.items.drain(..).collect();
        drop(state);
        for _ in &items {
            self.metrics.dequeue();
        }
        items
    }

    /// Whether a handle with `id` is currently queued.
    pub fn contains(&self, id: BufferId) -> bool {
        self.state.lock().queued.contains(&id)
    }

    /// Number of queued items, sentinels included.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Number of queued real handles.
    pub fn buffers(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Traffic counters for this FIFO.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl std::fmt::Debug for BufferFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferFifo")
            .field("items", &state.items.len())
            .field("buffers", &state.queued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLedger, Owner};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::{sync::Arc, thread};

    fn header(id: u32) -> BufferHeader {
        BufferHeader::new(BufferId(id), 0, 8)
    }

    #[test]
    fn sentinel_drains_after_queued_handles() {
        let mut rng = StdRng::seed_from_u64(0x5e71);
        for _ in 0..64 {
            let fifo = BufferFifo::new();
            let n = rng.gen_range(0..24u32);
            for id in 0..n {
                fifo.put(header(id)).unwrap();
            }
            fifo.put_sentinel();
            for id in 0..n {
                match fifo.get() {
                    FifoItem::Buffer(h) => assert_eq!(h.id(), BufferId(id)),
                    FifoItem::Sentinel => panic!("sentinel observed after {id} of {n}"),
                }
            }
            assert!(fifo.get().is_sentinel());
            assert!(fifo.is_empty());
        }
    }

    #[test]
    fn duplicate_put_hands_the_buffer_back() {
        let fifo = BufferFifo::new();
        fifo.put(header(4)).unwrap();
        let err = fifo.put(header(4)).unwrap_err();
        assert_eq!(err.into_inner().id(), BufferId(4));
        assert_eq!(fifo.buffers(), 1);
        let _ = fifo.get();
        fifo.put(header(4)).unwrap();
    }

    #[test]
    fn get_timeout_expires_on_empty_fifo() {
        let fifo = BufferFifo::new();
        let start = Instant::now();
        assert!(fifo.get_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(fifo.metrics().stalls() >= 1);
    }

    #[test]
    fn blocked_get_wakes_on_put_from_other_thread() {
        let fifo = Arc::new(BufferFifo::new());
        let producer = {
            let fifo = fifo.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fifo.put(header(9)).unwrap();
            })
        };
        let item = fifo.get_timeout(Duration::from_secs(5)).expect("item");
        assert_eq!(item.into_buffer().unwrap().id(), BufferId(9));
        producer.join().unwrap();
    }

    #[test]
    fn peek_does_not_consume() {
        let fifo = BufferFifo::new();
        let mut h = header(1);
        h.fill_from(b"xy");
        h.timestamp = 40;
        fifo.put(h).unwrap();
        let peeked = fifo.try_peek().unwrap();
        assert_eq!(
            peeked,
            Peeked::Buffer {
                id: BufferId(1),
                filled_len: 2,
                timestamp: 40,
                flags: BufferFlags::empty(),
            }
        );
        assert_eq!(fifo.len(), 1);
    }

    // Random submit/return interleavings: a handle is only ever queued by its current owner
    // and never appears twice in the FIFO.
    #[test]
    fn random_interleavings_keep_single_ownership() {
        let mut rng = StdRng::seed_from_u64(0x0111);
        let fifo = BufferFifo::new();
        let mut ledger = BufferLedger::default();
        let mut in_flight: Vec<BufferHeader> = Vec::new();
        for id in 0..8 {
            ledger.register(BufferId(id)).unwrap();
            fifo.put(header(id)).unwrap();
        }
        for _ in 0..4_000 {
            if rng.gen_bool(0.5) {
                if let Some(item) = fifo.try_get() {
                    let h = item.into_buffer().unwrap();
                    assert!(!fifo.contains(h.id()));
                    ledger.hand_to_native(h.id()).unwrap();
                    in_flight.push(h);
                }
            } else if !in_flight.is_empty() {
                let idx = rng.gen_range(0..in_flight.len());
                let h = in_flight.swap_remove(idx);
                ledger.returned(h.id()).unwrap();
                fifo.put(h).unwrap();
            }
            assert_eq!(fifo.buffers(), ledger.session_owned());
            assert_eq!(in_flight.len(), ledger.native_owned());
        }
        for h in &in_flight {
            assert_eq!(ledger.owner(h.id()), Some(Owner::Native));
            assert!(!fifo.contains(h.id()));
        }
    }
}
