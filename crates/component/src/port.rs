//! Per-direction port state and its buffer pool.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use ilkit_core::prelude::{
    BufferFifo, BufferHeader, BufferId, BufferLedger, EsFormat, FifoError, FifoItem, MediaKind,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::{
    ComponentError, Result,
    convert::NativeLayout,
    native::{NativeComponent, PortDefinition, PortDirection},
};

const UNBOUND: u32 = u32::MAX;

/// State shared between the control thread and completion callbacks.
///
/// Callbacks only touch the FIFO, the ledger and the flags.
#[derive(Debug)]
pub(crate) struct PortShared {
    index: AtomicU32,
    pub(crate) fifo: BufferFifo,
    pub(crate) ledger: Mutex<BufferLedger>,
    pub(crate) reconfigure_pending: AtomicBool,
    pub(crate) needs_format_refresh: AtomicBool,
}

impl PortShared {
    pub(crate) fn new() -> Self {
        Self {
            index: AtomicU32::new(UNBOUND),
            fifo: BufferFifo::new(),
            ledger: Mutex::new(BufferLedger::default()),
            reconfigure_pending: AtomicBool::new(false),
            needs_format_refresh: AtomicBool::new(false),
        }
    }

    pub(crate) fn index(&self) -> Option<u32> {
        match self.index.load(Ordering::Acquire) {
            UNBOUND => None,
            index => Some(index),
        }
    }

    /// Take a buffer back from the native side.
    pub(crate) fn buffer_done(&self, header: BufferHeader) {
        let id = header.id();
        if let Err(err) = self.ledger.lock().returned(id) {
            warn!(buffer = %id, %err, "completion for a buffer the session did not submit");
        }
        if let Err(FifoError::AlreadyQueued(header)) = self.fifo.put(header) {
            error!(buffer = %header.id(), "completed buffer already queued");
        }
    }
}

/// One input or output port of a loaded component.
#[derive(Debug)]
pub struct Port {
    direction: PortDirection,
    index: u32,
    definition: Option<PortDefinition>,
    format: EsFormat,
    shared: Arc<PortShared>,
    allocated: SmallVec<[BufferId; 16]>,
    enabled: bool,
    flushed: bool,
}

impl Port {
    pub(crate) fn new(direction: PortDirection, format: EsFormat) -> Self {
        Self {
            direction,
            index: UNBOUND,
            definition: None,
            format,
            shared: Arc::new(PortShared::new()),
            allocated: SmallVec::new(),
            enabled: false,
            flushed: true,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PortShared> {
        &self.shared
    }

    pub(crate) fn bind(&mut self, index: u32) {
        self.index = index;
        self.shared.index.store(index, Ordering::Release);
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    /// Pipeline-side format of the port.
    pub fn format(&self) -> &EsFormat {
        &self.format
    }

    pub(crate) fn format_mut(&mut self) -> &mut EsFormat {
        &mut self.format
    }

    /// Last negotiated or refreshed native definition.
    pub fn definition(&self) -> Option<&PortDefinition> {
        self.definition.as_ref()
    }

    pub(crate) fn set_definition(&mut self, definition: PortDefinition) {
        self.enabled = definition.enabled;
        self.definition = Some(definition);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether a flush has been issued since the last normal submission.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub(crate) fn set_flushed(&mut self, flushed: bool) {
        self.flushed = flushed;
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.shared.reconfigure_pending.load(Ordering::Acquire)
    }

    pub(crate) fn clear_reconfigure(&self) {
        self.shared.reconfigure_pending.store(false, Ordering::Release);
    }

    pub(crate) fn take_format_refresh(&self) -> bool {
        self.shared.needs_format_refresh.swap(false, Ordering::AcqRel)
    }

    /// Buffers currently held by the native side.
    pub fn native_owned(&self) -> usize {
        self.shared.ledger.lock().native_owned()
    }

    /// Ids of the buffers allocated for the current pool.
    pub fn buffer_ids(&self) -> &[BufferId] {
        &self.allocated
    }

    /// Buffers in the pool, wherever they are.
    pub fn pool_size(&self) -> usize {
        self.shared.ledger.lock().len()
    }

    pub(crate) fn fifo(&self) -> &BufferFifo {
        &self.shared.fifo
    }

    /// Record that `id` is being handed to the component.
    pub(crate) fn hand_to_native(&self, id: BufferId) {
        if let Err(err) = self.shared.ledger.lock().hand_to_native(id) {
            warn!(port = self.index, buffer = %id, %err, "submitting an untracked buffer");
        }
    }

    /// A submission was refused synchronously; the buffer is back with the session.
    pub(crate) fn take_back(&self, header: BufferHeader) {
        self.shared.buffer_done(header);
    }

    /// Requeue a buffer the session took but never submitted.
    pub(crate) fn put_back(&self, header: BufferHeader) {
        if let Err(FifoError::AlreadyQueued(header)) = self.shared.fifo.put(header) {
            error!(port = self.index, buffer = %header.id(), "buffer already queued");
        }
    }

    /// Allocate the pool described by the current definition into the FIFO.
    pub(crate) fn allocate(&mut self, component: &mut dyn NativeComponent) -> Result<()> {
        let Some(def) = self.definition else {
            return Err(ComponentError::BadParameter(format!(
                "port {} has no definition",
                self.index
            )));
        };
        let size = def.buffer_size as usize;
        for _ in 0..def.buffer_count_actual {
            let header = component
                .allocate_buffer(self.index, size)
                .map_err(|code| ComponentError::ResourceExhausted {
                    port: self.index,
                    code,
                })?;
            let id = header.id();
            if let Err(err) = self.shared.ledger.lock().register(id) {
                warn!(port = self.index, %err, "component reused a buffer id");
            }
            self.allocated.push(id);
            if let Err(FifoError::AlreadyQueued(header)) = self.shared.fifo.put(header) {
                error!(port = self.index, buffer = %header.id(), "fresh buffer already queued");
            }
        }
        debug!(
            port = self.index,
            count = def.buffer_count_actual,
            size,
            "buffers allocated"
        );
        Ok(())
    }

    /// Free every buffer of the pool, waiting up to `timeout` for the native side to
    /// return the ones it holds.
    ///
    /// Buffers still native-owned at the deadline stay in the ledger.
    pub(crate) fn free_buffers(
        &mut self,
        component: &mut dyn NativeComponent,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut first_error = None;
        while !self.shared.ledger.lock().is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.shared.fifo.get_timeout(remaining) {
                Some(FifoItem::Buffer(header)) => {
                    let id = header.id();
                    if let Err(err) = self.shared.ledger.lock().release(id) {
                        warn!(port = self.index, %err, "freeing an untracked buffer");
                    }
                    self.allocated.retain(|a| *a != id);
                    if let Err(code) = component.free_buffer(self.index, header) {
                        first_error.get_or_insert(ComponentError::native("free buffer", code));
                    }
                }
                Some(FifoItem::Sentinel) => {}
                None => {
                    let held = self.native_owned();
                    warn!(port = self.index, held, "buffers not returned before deadline");
                    return Err(ComponentError::Timeout {
                        waiting_for: format!("{held} buffers on port {}", self.index),
                    });
                }
            }
        }
        debug!(port = self.index, "buffers freed");
        first_error.map_or(Ok(()), Err)
    }

    /// Drop whatever is left in the FIFO and forget the pool.
    ///
    /// Returns how many buffers the native side never gave back.
    pub(crate) fn abandon(&mut self, mut component: Option<&mut dyn NativeComponent>) -> usize {
        for item in self.shared.fifo.drain() {
            if let FifoItem::Buffer(header) = item {
                let _ = self.shared.ledger.lock().release(header.id());
                if let Some(component) = component.as_deref_mut() {
                    let _ = component.free_buffer(self.index, header);
                }
            }
        }
        let stranded = self.shared.ledger.lock().abandon();
        if !stranded.is_empty() {
            warn!(port = self.index, ?stranded, "buffers never returned by the component");
        }
        self.allocated.clear();
        stranded.len()
    }

    /// Copy-out geometry of a raw video port.
    pub fn layout(&self) -> Option<NativeLayout> {
        let def = self.definition.as_ref()?;
        let native = def.video()?;
        let video = self.format.as_video()?;
        let chroma = video.chroma?;
        let mut layout = NativeLayout::new(
            chroma,
            video.width,
            video.height,
            native.stride.max(0) as u32,
            native.slice_height,
        )?;
        layout.crop_top = video.visible.map_or(0, |c| c.top);
        Some(layout.with_color(native.color))
    }
}
