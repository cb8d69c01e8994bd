use std::{collections::HashMap, fmt};

/// Stable identifier for a native buffer within its owning port.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::BufferId;
///
/// let id = BufferId(3);
/// assert_eq!(id.to_string(), "#3");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Flags carried by a buffer handle between the session and the native component.
    ///
    /// # Example
    /// ```rust
    /// use ilkit_core::prelude::BufferFlags;
    ///
    /// let flags = BufferFlags::END_OF_FRAME | BufferFlags::SYNC_FRAME;
    /// assert!(flags.contains(BufferFlags::END_OF_FRAME));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const END_OF_STREAM = 1 << 0;
        /// Buffer carries the stream start time.
        const START_TIME = 1 << 1;
        /// Decode but do not present.
        const DECODE_ONLY = 1 << 2;
        /// Payload is known to be damaged.
        const DATA_CORRUPT = 1 << 3;
        /// Buffer closes a frame.
        const END_OF_FRAME = 1 << 4;
        /// Frame can be decoded independently.
        const SYNC_FRAME = 1 << 5;
        /// Extra data follows the payload.
        const EXTRA_DATA = 1 << 6;
        /// Out-of-band codec configuration (parameter sets, sequence headers).
        const CODEC_CONFIG = 1 << 7;
        /// First buffer after a gap in the stream.
        const DISCONTINUITY = 1 << 8;
    }
}

/// Native buffer handle exchanged between a session and a component.
///
/// Ownership of the handle is the ownership of the memory: the value is moved into the
/// native component on submission and moved back by the completion callback, so it can
/// never be held by both sides at once.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{BufferFlags, BufferHeader, BufferId};
///
/// let mut header = BufferHeader::new(BufferId(0), 1, 16);
/// assert_eq!(header.fill_from(b"abc"), 3);
/// header.flags |= BufferFlags::END_OF_FRAME;
/// assert_eq!(header.payload(), b"abc");
/// ```
pub struct BufferHeader {
    id: BufferId,
    port: u32,
    data: Box<[u8]>,
    offset: usize,
    filled: usize,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Buffer flags.
    pub flags: BufferFlags,
}

impl BufferHeader {
    /// Allocate a zeroed buffer of `capacity` bytes for `port`.
    pub fn new(id: BufferId, port: u32, capacity: usize) -> Self {
        Self {
            id,
            port,
            data: vec![0; capacity].into_boxed_slice(),
            offset: 0,
            filled: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
        }
    }

    /// Identifier of this buffer.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Port index the buffer was allocated on.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Allocated length in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Offset of the payload within the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of valid payload bytes.
    pub fn filled_len(&self) -> usize {
        self.filled
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Borrow the valid payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.filled]
    }

    /// Borrow the valid payload mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.filled]
    }

    /// Borrow the whole allocation for writing; call [`BufferHeader::set_range`] afterwards.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark `len` bytes starting at `offset` as valid, clamped to the allocation.
    pub fn set_range(&mut self, offset: usize, len: usize) {
        let offset = offset.min(self.data.len());
        self.offset = offset;
        self.filled = len.min(self.data.len() - offset);
    }

    /// Copy as much of `src` as fits, starting at offset zero. Returns the copied length.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.offset = 0;
        self.filled = n;
        n
    }

    /// Reset payload, timestamp and flags so the buffer can be handed out empty.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.filled = 0;
        self.timestamp = 0;
        self.flags = BufferFlags::empty();
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("capacity", &self.data.len())
            .field("offset", &self.offset)
            .field("filled", &self.filled)
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Side currently holding a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Owner {
    /// Queued in a FIFO or being filled by the pipeline.
    Session,
    /// Submitted and not yet returned by a completion callback.
    Native,
}

/// Ownership violations detected by a [`BufferLedger`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("buffer {0} is not tracked")]
    Unknown(BufferId),
    #[error("buffer {0} is already tracked")]
    Duplicate(BufferId),
    #[error("buffer {id} is owned by {actual:?}, expected {expected:?}")]
    WrongOwner {
        id: BufferId,
        actual: Owner,
        expected: Owner,
    },
}

/// Per-port record of who owns each buffer.
///
/// Every transition is checked, so a buffer handed out twice or returned twice is reported
/// instead of silently corrupting the pool.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{BufferId, BufferLedger, Owner};
///
/// let mut ledger = BufferLedger::default();
/// ledger.register(BufferId(0)).unwrap();
/// ledger.hand_to_native(BufferId(0)).unwrap();
/// assert_eq!(ledger.owner(BufferId(0)), Some(Owner::Native));
/// assert!(ledger.hand_to_native(BufferId(0)).is_err());
/// ledger.returned(BufferId(0)).unwrap();
/// ledger.release(BufferId(0)).unwrap();
/// assert!(ledger.is_empty());
/// ```
#[derive(Debug, Default, Clone)]
pub struct BufferLedger {
    owners: HashMap<BufferId, Owner>,
}

impl BufferLedger {
    /// Track a freshly allocated buffer as session-owned.
    pub fn register(&mut self, id: BufferId) -> Result<(), LedgerError> {
        if self.owners.contains_key(&id) {
            return Err(LedgerError::Duplicate(id));
        }
        self.owners.insert(id, Owner::Session);
        Ok(())
    }

    /// Record a submission to the native side.
    pub fn hand_to_native(&mut self, id: BufferId) -> Result<(), LedgerError> {
        self.transition(id, Owner::Session, Owner::Native)
    }

    /// Record a completion callback returning the buffer.
    pub fn returned(&mut self, id: BufferId) -> Result<(), LedgerError> {
        self.transition(id, Owner::Native, Owner::Session)
    }

    /// Stop tracking a session-owned buffer that is being freed.
    pub fn release(&mut self, id: BufferId) -> Result<(), LedgerError> {
        match self.owners.get(&id) {
            None => Err(LedgerError::Unknown(id)),
            Some(Owner::Session) => {
                self.owners.remove(&id);
                Ok(())
            }
            Some(&actual) => Err(LedgerError::WrongOwner {
                id,
                actual,
                expected: Owner::Session,
            }),
        }
    }

    /// Drop every record, returning the ids the native side still held.
    pub fn abandon(&mut self) -> Vec<BufferId> {
        let mut stranded: Vec<BufferId> = self
            .owners
            .drain()
            .filter(|(_, owner)| *owner == Owner::Native)
            .map(|(id, _)| id)
            .collect();
        stranded.sort();
        stranded
    }

    /// Current owner of `id`, if tracked.
    pub fn owner(&self, id: BufferId) -> Option<Owner> {
        self.owners.get(&id).copied()
    }

    /// Number of buffers held by the native side.
    pub fn native_owned(&self) -> usize {
        self.owners.values().filter(|o| **o == Owner::Native).count()
    }

    /// Number of buffers held by the session.
    pub fn session_owned(&self) -> usize {
        self.owners.values().filter(|o| **o == Owner::Session).count()
    }

    /// Number of tracked buffers.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether no buffers are tracked.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    fn transition(&mut self, id: BufferId, from: Owner, to: Owner) -> Result<(), LedgerError> {
        let slot = self.owners.get_mut(&id).ok_or(LedgerError::Unknown(id))?;
        if *slot != from {
            return Err(LedgerError::WrongOwner {
                id,
                actual: *slot,
                expected: from,
            });
        }
        *slot = to;
        Ok(())
    }
}
