#![doc = include_str!("../README.md")]

mod component;

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use ilkit_component::native::{
    ComponentState, ErrorCode, NativeBackend, NativeCallbacks, NativeComponent,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use component::VirtualComponent;

/// Output geometry change a component announces after some inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsChange {
    /// Media inputs (codec configuration excluded) consumed before the change.
    pub after_inputs: u32,
    pub width: u32,
    pub height: u32,
}

/// Catalog entry describing one simulated component.
///
/// # Example
/// ```rust
/// use ilkit_virtual::VirtualComponentSpec;
///
/// let spec = VirtualComponentSpec::new("OMX.virtual.avc.decoder", ["video_decoder.avc"])
///     .with_buffers(6, 32 * 1024)
///     .with_settings_change(2, 1920, 1080);
/// assert_eq!(spec.buffer_count, 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualComponentSpec {
    pub name: String,
    pub roles: Vec<String>,
    /// Buffers per port.
    pub buffer_count: u32,
    /// Smallest buffer the component reports.
    pub min_buffer_size: u32,
    /// Alignment applied to raw picture strides.
    pub stride_align: u32,
    /// A state the component never finishes entering.
    pub hang_on: Option<ComponentState>,
    pub settings_change: Option<SettingsChange>,
    /// Report a benign stream error every n media inputs.
    pub corrupt_every: Option<u32>,
    /// Refuse to load with this code.
    pub fail_open: Option<ErrorCode>,
    /// Refuse every port definition write.
    pub refuse_definitions: bool,
}

impl VirtualComponentSpec {
    pub fn new<I, S>(name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            buffer_count: 4,
            min_buffer_size: 16 * 1024,
            stride_align: 32,
            hang_on: None,
            settings_change: None,
            corrupt_every: None,
            fail_open: None,
            refuse_definitions: false,
        }
    }

    pub fn with_buffers(mut self, count: u32, min_size: u32) -> Self {
        self.buffer_count = count.max(1);
        self.min_buffer_size = min_size;
        self
    }

    pub fn with_stride_align(mut self, align: u32) -> Self {
        self.stride_align = align.max(1);
        self
    }

    pub fn hanging_on(mut self, state: ComponentState) -> Self {
        self.hang_on = Some(state);
        self
    }

    pub fn with_settings_change(mut self, after_inputs: u32, width: u32, height: u32) -> Self {
        self.settings_change = Some(SettingsChange {
            after_inputs,
            width,
            height,
        });
        self
    }

    pub fn with_corruption_every(mut self, inputs: u32) -> Self {
        self.corrupt_every = (inputs > 0).then_some(inputs);
        self
    }

    pub fn failing_open(mut self, code: ErrorCode) -> Self {
        self.fail_open = Some(code);
        self
    }

    pub fn refusing_definitions(mut self) -> Self {
        self.refuse_definitions = true;
        self
    }
}

#[derive(Debug, Default)]
struct CodecConfigParts {
    pending: Vec<u8>,
    complete: Vec<u8>,
}

/// Live counters of a virtual backend, shared with its components.
#[derive(Debug, Default)]
pub struct VirtualStats {
    live_buffers: AtomicUsize,
    open_handles: AtomicUsize,
    inits: AtomicUsize,
    deinits: AtomicUsize,
    flushes: AtomicU64,
    codec_configs: AtomicU64,
    codec_config: Mutex<CodecConfigParts>,
    inputs: AtomicU64,
    outputs: AtomicU64,
    settings_changes: AtomicU64,
}

impl VirtualStats {
    /// Buffers allocated and not yet freed, across all components.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::Acquire)
    }

    pub fn deinits(&self) -> usize {
        self.deinits.load(Ordering::Acquire)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Complete codec configurations received; a split one counts once.
    pub fn codec_configs(&self) -> u64 {
        self.codec_configs.load(Ordering::Acquire)
    }

    /// Bytes of the last complete codec configuration, reassembled from its parts.
    pub fn last_codec_config(&self) -> Vec<u8> {
        self.codec_config.lock().complete.clone()
    }

    pub fn inputs(&self) -> u64 {
        self.inputs.load(Ordering::Acquire)
    }

    pub fn outputs(&self) -> u64 {
        self.outputs.load(Ordering::Acquire)
    }

    pub fn settings_changes(&self) -> u64 {
        self.settings_changes.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_allocated(&self) {
        self.live_buffers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn buffer_freed(&self) {
        let _ = self
            .live_buffers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn handle_closed(&self) {
        let _ = self
            .open_handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn codec_config(&self, part: &[u8], last: bool) {
        let mut config = self.codec_config.lock();
        config.pending.extend_from_slice(part);
        if last {
            config.complete = std::mem::take(&mut config.pending);
            self.codec_configs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn input(&self) {
        self.inputs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn output(&self) {
        self.outputs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn settings_changed(&self) {
        self.settings_changes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Native core whose components run on worker threads in this process.
///
/// # Example
/// ```rust
/// use ilkit_component::native::NativeBackend;
/// use ilkit_virtual::{VirtualBackend, VirtualComponentSpec};
///
/// let backend = VirtualBackend::new("virtual")
///     .with_component(VirtualComponentSpec::new("OMX.virtual.avc", ["video_decoder.avc"]));
/// assert_eq!(backend.components_of_role("video_decoder.avc"), ["OMX.virtual.avc"]);
/// assert!(backend.components_of_role("audio_decoder.aac").is_empty());
/// ```
#[derive(Debug)]
pub struct VirtualBackend {
    name: String,
    hardware: bool,
    catalog: Vec<VirtualComponentSpec>,
    stats: Arc<VirtualStats>,
}

impl VirtualBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hardware: true,
            catalog: Vec::new(),
            stats: Arc::new(VirtualStats::default()),
        }
    }

    /// Report components as software ones for candidate ordering.
    pub fn software(mut self) -> Self {
        self.hardware = false;
        self
    }

    pub fn with_component(mut self, spec: VirtualComponentSpec) -> Self {
        self.catalog.push(spec);
        self
    }

    pub fn stats(&self) -> &Arc<VirtualStats> {
        &self.stats
    }

    pub fn catalog(&self) -> &[VirtualComponentSpec] {
        &self.catalog
    }
}

impl NativeBackend for VirtualBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_hardware(&self) -> bool {
        self.hardware
    }

    fn init(&self) -> Result<(), ErrorCode> {
        self.stats.inits.fetch_add(1, Ordering::AcqRel);
        debug!(backend = %self.name, "virtual core up");
        Ok(())
    }

    fn deinit(&self) {
        self.stats.deinits.fetch_add(1, Ordering::AcqRel);
        debug!(backend = %self.name, "virtual core down");
    }

    fn components_of_role(&self, role: &str) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|spec| spec.roles.iter().any(|r| r == role))
            .map(|spec| spec.name.clone())
            .collect()
    }

    fn get_handle(
        &self,
        component: &str,
        callbacks: Arc<dyn NativeCallbacks>,
    ) -> Result<Box<dyn NativeComponent>, ErrorCode> {
        let spec = self
            .catalog
            .iter()
            .find(|spec| spec.name == component)
            .ok_or(ErrorCode::ComponentNotFound)?;
        if let Some(code) = spec.fail_open {
            warn!(component, %code, "virtual component refuses to load");
            return Err(code);
        }
        let handle = VirtualComponent::spawn(spec.clone(), callbacks, Arc::clone(&self.stats))?;
        self.stats.open_handles.fetch_add(1, Ordering::AcqRel);
        info!(backend = %self.name, component, "virtual component loaded");
        Ok(Box::new(handle))
    }

    fn free_handle(&self, component: Box<dyn NativeComponent>) -> Result<(), ErrorCode> {
        debug!(backend = %self.name, component = component.name(), "freeing virtual component");
        drop(component);
        Ok(())
    }
}

pub mod prelude {
    pub use crate::{
        SettingsChange, VirtualBackend, VirtualComponent, VirtualComponentSpec, VirtualStats,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilkit_component::native::ComponentEvent;
    use ilkit_core::prelude::BufferHeader;

    struct Silent;

    impl NativeCallbacks for Silent {
        fn on_event(&self, _event: ComponentEvent) {}
        fn on_empty_buffer_done(&self, _header: BufferHeader) {}
        fn on_fill_buffer_done(&self, _header: BufferHeader) {}
    }

    #[test]
    fn handles_are_counted() {
        let backend = VirtualBackend::new("virtual-handles")
            .with_component(VirtualComponentSpec::new("OMX.virtual.mp3", ["audio_decoder.mp3"]));
        let handle = backend.get_handle("OMX.virtual.mp3", Arc::new(Silent)).unwrap();
        assert_eq!(backend.stats().open_handles(), 1);
        backend.free_handle(handle).unwrap();
        assert_eq!(backend.stats().open_handles(), 0);
    }

    #[test]
    fn unknown_and_refusing_components() {
        let backend = VirtualBackend::new("virtual-refusing").with_component(
            VirtualComponentSpec::new("OMX.virtual.broken", ["video_decoder.avc"])
                .failing_open(ErrorCode::InsufficientResources),
        );
        assert_eq!(
            backend.get_handle("OMX.nope", Arc::new(Silent)).err(),
            Some(ErrorCode::ComponentNotFound)
        );
        assert_eq!(
            backend.get_handle("OMX.virtual.broken", Arc::new(Silent)).err(),
            Some(ErrorCode::InsufficientResources)
        );
        assert_eq!(backend.stats().open_handles(), 0);
    }
}
