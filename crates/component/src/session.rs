//! Lifecycle state machine and buffer exchange for one native component.
//!
//! A session is driven from a single control thread. Native completions arrive on foreign
//! threads through [`CallbackSink`], which only enqueues into the port FIFOs and the event
//! queue and flips port flags; every decision is taken here, between buffer exchanges.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use ilkit_core::prelude::{
    BufferFlags, BufferHeader, EsFormat, EventQueue, FifoItem, MediaKind, WaitOutcome, codes,
};
use tracing::{debug, error, info, warn};

use crate::{
    CodecKind, ComponentError, Result,
    convert::{FrameConverter, PackedCopy},
    core::CoreGuard,
    csd::{CodecConfig, h264_profile_level, nal_length_size, prepare_codec_config},
    nal::{NalRepacker, RepackError},
    native::{
        Command, ComponentEvent, ComponentState, NativeBackend, NativeCallbacks, NativeComponent,
        PortDirection, Rejected, SettingsReason,
    },
    negotiate::FormatNegotiator,
    port::{Port, PortShared},
    quirks::{QuirkFlags, QuirkTable},
    roles::role_for,
};

/// Default wait for a command completion.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
/// Default single wait for a free input buffer.
pub const DEFAULT_INPUT_WAIT_STEP: Duration = Duration::from_millis(10);
/// Default total wait for a free input buffer per submission.
pub const DEFAULT_INPUT_DEADLINE: Duration = Duration::from_secs(1);
/// Default single wait for a filled output buffer.
pub const DEFAULT_OUTPUT_WAIT_STEP: Duration = Duration::from_millis(10);
/// Default number of back-to-back input timeouts before the session is failed.
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Lifecycle state as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    Unloaded,
    Loaded,
    Idle,
    Executing,
    /// Terminal; the session can only be closed.
    ErrorState,
}

/// Timing knobs of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    pub command_timeout: Duration,
    pub input_wait_step: Duration,
    pub input_deadline: Duration,
    pub output_wait_step: Duration,
    pub max_consecutive_timeouts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            input_wait_step: DEFAULT_INPUT_WAIT_STEP,
            input_deadline: DEFAULT_INPUT_DEADLINE,
            output_wait_step: DEFAULT_OUTPUT_WAIT_STEP,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
        }
    }
}

/// What to load and how to configure it.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub kind: CodecKind,
    /// Format fed to the input port.
    pub input: EsFormat,
    /// Desired format of the output port; decoders may leave the chroma unset.
    pub output: EsFormat,
    pub config: SessionConfig,
}

impl SessionRequest {
    /// Codec of the compressed side.
    pub fn codec(&self) -> ilkit_core::prelude::FourCc {
        match self.kind {
            CodecKind::Decoder => self.input.codec,
            CodecKind::Encoder => self.output.codec,
        }
    }
}

/// One unit produced by the component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputUnit {
    pub data: Vec<u8>,
    /// Microseconds, as stamped by the component.
    pub timestamp: i64,
    pub flags: BufferFlags,
}

/// Counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub inputs: u64,
    pub outputs: u64,
    pub flushes: u64,
    pub reconfigurations: u64,
    pub dropped_units: u64,
    pub benign_errors: u64,
    pub timeouts: u64,
}

/// Completion sink handed to the native component.
struct CallbackSink {
    events: Arc<EventQueue<ComponentEvent>>,
    input: Arc<PortShared>,
    output: Arc<PortShared>,
}

impl NativeCallbacks for CallbackSink {
    fn on_event(&self, event: ComponentEvent) {
        if let ComponentEvent::PortSettingsChanged { port, reason } = event {
            match reason {
                SettingsReason::Unspecified
                | SettingsReason::PortDefinition
                | SettingsReason::AudioPcm => {
                    self.output
                        .reconfigure_pending
                        .store(true, std::sync::atomic::Ordering::Release);
                    self.input.fifo.put_sentinel();
                }
                SettingsReason::OutputCrop => {
                    for shared in [&self.input, &self.output] {
                        if shared.index() == Some(port) {
                            shared
                                .needs_format_refresh
                                .store(true, std::sync::atomic::Ordering::Release);
                        }
                    }
                }
                SettingsReason::Other(_) => {}
            }
        }
        self.events.post(event);
    }

    fn on_empty_buffer_done(&self, header: BufferHeader) {
        self.input.buffer_done(header);
    }

    fn on_fill_buffer_done(&self, header: BufferHeader) {
        self.output.buffer_done(header);
    }
}

fn component_of(
    slot: &mut Option<Box<dyn NativeComponent>>,
) -> Result<&mut Box<dyn NativeComponent>> {
    slot.as_mut().ok_or(ComponentError::InvalidState {
        operation: "native call",
        state: SessionState::Unloaded,
    })
}

/// A loaded native component and its two ports.
///
/// # Example
/// ```rust,ignore
/// use ilkit_component::prelude::*;
///
/// let mut session = ComponentSession::load(backend, "OMX.vendor.avc", request, quirks)?;
/// session.start()?;
/// session.submit_input(&unit, pts, BufferFlags::empty())?;
/// while let Some(frame) = session.poll_output()? {
///     // ...
/// }
/// session.close();
/// ```
pub struct ComponentSession {
    name: String,
    kind: CodecKind,
    backend: Arc<dyn NativeBackend>,
    component: Option<Box<dyn NativeComponent>>,
    events: Arc<EventQueue<ComponentEvent>>,
    input: Port,
    output: Port,
    state: SessionState,
    outstanding: Option<Command>,
    negotiator: FormatNegotiator,
    repacker: Option<NalRepacker>,
    codec_config: Option<CodecConfig>,
    converter: Arc<dyn FrameConverter>,
    config: SessionConfig,
    ready: VecDeque<OutputUnit>,
    consecutive_timeouts: u32,
    stats: SessionStats,
    core: Option<CoreGuard>,
}

impl ComponentSession {
    /// Load component `name` from `backend` and bring it to `Loaded`.
    ///
    /// Any failure after the handle is obtained tears the component down before
    /// returning.
    pub fn load(
        backend: Arc<dyn NativeBackend>,
        name: &str,
        request: SessionRequest,
        quirks: Arc<QuirkTable>,
    ) -> Result<Self> {
        let codec = request.codec();
        let media = request.input.kind();
        let role = role_for(codec, media, request.kind).ok_or_else(|| {
            ComponentError::BadParameter(format!(
                "no {} role for {codec}",
                request.kind.as_str()
            ))
        })?;
        let core = CoreGuard::acquire(&backend)?;

        let events = Arc::new(EventQueue::new());
        let input = Port::new(PortDirection::Input, request.input.clone());
        let output = Port::new(PortDirection::Output, request.output.clone());
        let sink = Arc::new(CallbackSink {
            events: Arc::clone(&events),
            input: Arc::clone(input.shared()),
            output: Arc::clone(output.shared()),
        });
        let component = backend.get_handle(name, sink).map_err(|code| {
            warn!(component = name, %code, "get handle failed");
            ComponentError::native("get handle", code)
        })?;

        let profile_level = if codec == codes::H264 {
            h264_profile_level(&request.input.extra)
        } else {
            None
        };
        let negotiator = FormatNegotiator::new(name, request.kind, codec, quirks)
            .with_profile_level(profile_level);

        let mut session = Self {
            name: name.to_owned(),
            kind: request.kind,
            backend,
            component: Some(component),
            events,
            input,
            output,
            state: SessionState::Loaded,
            outstanding: None,
            negotiator,
            repacker: None,
            codec_config: None,
            converter: Arc::new(PackedCopy),
            config: request.config,
            ready: VecDeque::new(),
            consecutive_timeouts: 0,
            stats: SessionStats::default(),
            core: Some(core),
        };
        session.configure(role, media)?;
        info!(component = name, role, "component loaded");
        Ok(session)
    }

    fn configure(&mut self, role: &str, media: MediaKind) -> Result<()> {
        let component = component_of(&mut self.component)?;
        component
            .set_role(role)
            .map_err(|code| ComponentError::native("set role", code))?;
        let range = component
            .ports(media)
            .map_err(|code| ComponentError::native("enumerate ports", code))?;
        let mut found_input = false;
        let mut found_output = false;
        for index in range {
            let def = component
                .port_definition(index)
                .map_err(|code| ComponentError::native("get port definition", code))?;
            match def.direction {
                PortDirection::Input if !found_input => {
                    self.input.bind(index);
                    found_input = true;
                }
                PortDirection::Output if !found_output => {
                    self.output.bind(index);
                    found_output = true;
                }
                _ => {}
            }
        }
        if !(found_input && found_output) {
            warn!(component = %self.name, role, "component lacks an input or output port");
            return Err(ComponentError::NoComponent {
                role: role.to_owned(),
            });
        }

        let flags = self.negotiator.flags();
        let input = self.input.format();
        if self.kind == CodecKind::Decoder
            && flags.contains(QuirkFlags::NEED_CSD)
            && input.extra.is_empty()
        {
            warn!(component = %self.name, "component needs codec configuration data");
            return Err(ComponentError::NegotiationFailed {
                port: self.input.index(),
                reason: "codec configuration data required".into(),
            });
        }
        if flags.contains(QuirkFlags::AUDIO_NEED_CHANNELS)
            && input.as_audio().is_some_and(|a| a.channels == 0)
        {
            return Err(ComponentError::BadParameter(
                "component needs a channel count".into(),
            ));
        }
        if self.kind == CodecKind::Decoder {
            self.repacker = nal_length_size(input).and_then(NalRepacker::new);
            self.codec_config = prepare_codec_config(input);
        }
        debug!(
            component = %self.name,
            input = self.input.index(),
            output = self.output.index(),
            ?flags,
            "ports bound"
        );
        Ok(())
    }

    /// Replace the output picture converter.
    pub fn with_converter(mut self, converter: Arc<dyn FrameConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn quirks(&self) -> QuirkFlags {
        self.negotiator.flags()
    }

    pub fn input_port(&self) -> &Port {
        &self.input
    }

    pub fn output_port(&self) -> &Port {
        &self.output
    }

    /// Current format of the produced units.
    pub fn output_format(&self) -> &EsFormat {
        self.output.format()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Command issued and not yet observed as complete.
    pub fn outstanding(&self) -> Option<Command> {
        self.outstanding
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ComponentError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn fail(&mut self, err: ComponentError) -> ComponentError {
        if self.state != SessionState::ErrorState {
            error!(component = %self.name, code = err.code(), %err, "session failed");
            self.state = SessionState::ErrorState;
        }
        err
    }

    /// Bring a loaded component to `Executing`.
    pub fn start(&mut self) -> Result<()> {
        self.to_idle()?;
        self.to_executing()
    }

    fn send(&mut self, command: Command) -> Result<()> {
        if let Some(pending) = self.outstanding {
            warn!(component = %self.name, %pending, %command, "overlapping command refused");
            return Err(ComponentError::InvalidState {
                operation: "send command",
                state: self.state,
            });
        }
        let component = component_of(&mut self.component)?;
        component
            .send_command(command)
            .map_err(|code| ComponentError::native("send command", code))?;
        debug!(component = %self.name, %command, "command sent");
        self.outstanding = Some(command);
        Ok(())
    }

    // Waits for `command` to complete; any non-benign error event ends the wait.
    fn await_command(&mut self, command: Command) -> Result<()> {
        let name = &self.name;
        let benign = &mut self.stats.benign_errors;
        let outcome = self.events.wait_for(
            |event| match event {
                ComponentEvent::CommandComplete(done) => *done == command,
                ComponentEvent::Error { code, detail } if code.is_benign() => {
                    *benign += 1;
                    debug!(component = %name, %command, %code, detail, "stream error absorbed");
                    false
                }
                ComponentEvent::Error { .. } => true,
                _ => false,
            },
            self.config.command_timeout,
        );
        self.outstanding = None;
        match outcome {
            WaitOutcome::Event(ComponentEvent::Error { code, detail }) => {
                error!(component = %self.name, %command, %code, detail, "command failed");
                Err(self.fail(ComponentError::native("command", code)))
            }
            WaitOutcome::Event(_) => {
                debug!(component = %self.name, %command, "command complete");
                Ok(())
            }
            WaitOutcome::Timeout => {
                warn!(component = %self.name, %command, "command timed out");
                self.stats.timeouts += 1;
                Err(self.fail(ComponentError::timeout(command)))
            }
        }
    }

    fn send_and_wait(&mut self, command: Command) -> Result<()> {
        self.send(command)?;
        self.await_command(command)
    }

    /// `Loaded` to `Idle`: negotiate and enable both ports, then populate them.
    pub fn to_idle(&mut self) -> Result<()> {
        self.require(SessionState::Loaded, "enter idle")?;
        for direction in [PortDirection::Input, PortDirection::Output] {
            let component = component_of(&mut self.component)?;
            let port = match direction {
                PortDirection::Input => &mut self.input,
                PortDirection::Output => &mut self.output,
            };
            let def = self
                .negotiator
                .negotiate(&mut **component, port.index(), port.format())?;
            port.set_definition(def);
            if !def.enabled {
                let index = port.index();
                self.send_and_wait(Command::PortEnable(index))?;
                self.port_mut(direction).set_enabled(true);
            }
        }

        self.send(Command::StateSet(ComponentState::Idle))?;
        if let Err(err) = self.allocate_pools() {
            self.abort_idle();
            return Err(err);
        }
        self.await_command(Command::StateSet(ComponentState::Idle))?;
        self.state = SessionState::Idle;
        info!(component = %self.name, "component idle");
        Ok(())
    }

    fn port_mut(&mut self, direction: PortDirection) -> &mut Port {
        match direction {
            PortDirection::Input => &mut self.input,
            PortDirection::Output => &mut self.output,
        }
    }

    fn allocate_pools(&mut self) -> Result<()> {
        let component = component_of(&mut self.component)?;
        self.input.allocate(&mut **component)?;
        self.output.allocate(&mut **component)
    }

    fn abort_idle(&mut self) {
        warn!(component = %self.name, "aborting idle transition");
        self.outstanding = None;
        let loaded = Command::StateSet(ComponentState::Loaded);
        let sent = self.send(loaded);
        self.free_pools();
        if sent.is_ok() {
            let _ = self.await_command(loaded);
        }
    }

    fn free_pools(&mut self) {
        let timeout = self.config.command_timeout;
        let Some(component) = self.component.as_deref_mut() else {
            return;
        };
        for port in [&mut self.input, &mut self.output] {
            if let Err(err) = port.free_buffers(component, timeout) {
                warn!(port = port.index(), %err, "freeing buffers failed");
            }
        }
    }

    /// `Idle` to `Executing`, then send codec configuration ahead of any media.
    pub fn to_executing(&mut self) -> Result<()> {
        self.require(SessionState::Idle, "enter executing")?;
        self.send_and_wait(Command::StateSet(ComponentState::Executing))?;
        self.state = SessionState::Executing;
        info!(component = %self.name, "component executing");

        self.submit_codec_config()?;
        self.refresh_output().map_err(|e| self.fail(e))?;
        self.pump_events()?;
        self.service_output()
    }

    // Configuration larger than one input buffer is split; every part carries
    // `CODEC_CONFIG` and only the last one `END_OF_FRAME`.
    fn submit_codec_config(&mut self) -> Result<()> {
        let Some(config) = self.codec_config.take() else {
            return Ok(());
        };
        debug!(component = %self.name, size = config.data.len(), "sending codec configuration");
        let deadline = Instant::now() + self.config.command_timeout;
        let mut rest = &config.data[..];
        let mut parts = 0u32;
        loop {
            let mut header = self.next_input_buffer(deadline)?;
            let copied = header.fill_from(rest);
            if copied == 0 && !rest.is_empty() {
                self.input.put_back(header);
                return Err(self.fail(ComponentError::BadParameter(
                    "input buffers have no capacity".into(),
                )));
            }
            rest = &rest[copied..];
            parts += 1;
            header.timestamp = 0;
            header.flags = BufferFlags::CODEC_CONFIG;
            header.flags.set(BufferFlags::END_OF_FRAME, rest.is_empty());
            self.empty(header)?;
            if rest.is_empty() {
                break;
            }
        }
        if parts > 1 {
            debug!(component = %self.name, parts, "codec configuration split across buffers");
        }
        Ok(())
    }

    fn refresh_output(&mut self) -> Result<()> {
        let component = component_of(&mut self.component)?;
        let index = self.output.index();
        let def = self
            .negotiator
            .refresh(&**component, index, self.output.format_mut())?;
        self.output.set_definition(def);
        Ok(())
    }

    fn pump_events(&mut self) -> Result<()> {
        while let Some(event) = self.events.try_next() {
            self.observe(event)?;
        }
        Ok(())
    }

    fn observe(&mut self, event: ComponentEvent) -> Result<()> {
        match event {
            ComponentEvent::Error { code, detail } if code.is_benign() => {
                self.stats.benign_errors += 1;
                debug!(component = %self.name, %code, detail, "stream error absorbed");
            }
            ComponentEvent::Error { code, detail } => {
                error!(component = %self.name, %code, detail, "component reported an error");
                return Err(self.fail(ComponentError::native("component", code)));
            }
            ComponentEvent::PortSettingsChanged { port, reason } => {
                info!(component = %self.name, port, ?reason, "port settings changed");
            }
            ComponentEvent::CommandComplete(command) => {
                debug!(component = %self.name, %command, "late command completion");
            }
            ComponentEvent::BufferFlag { port, flags } => {
                debug!(component = %self.name, port, ?flags, "buffer flag");
            }
            ComponentEvent::Other { kind, data1, data2 } => {
                debug!(component = %self.name, kind, data1, data2, "unhandled event");
            }
        }
        Ok(())
    }

    fn check_running(&mut self, operation: &'static str) -> Result<()> {
        self.require(SessionState::Executing, operation)?;
        self.pump_events()
    }

    /// Feed one unit to the input port.
    ///
    /// Blocks while every input buffer is held by the component, servicing the output
    /// side meanwhile. A discontinuous or corrupt unit is not submitted; it flushes the
    /// input port instead, once per run of such units. Units larger than one buffer are
    /// split, with `END_OF_FRAME` on the last part only.
    pub fn submit_input(&mut self, data: &[u8], timestamp: i64, flags: BufferFlags) -> Result<()> {
        self.check_running("submit input")?;
        if flags.intersects(BufferFlags::DISCONTINUITY | BufferFlags::DATA_CORRUPT) {
            return self.flush();
        }

        let capacity = self
            .input
            .definition()
            .map_or(usize::MAX, |d| d.buffer_size as usize);
        let repacked: Vec<u8>;
        let (unit, repack_in_place): (&[u8], bool) = match self.repacker {
            Some(repacker) if data.len() > capacity => {
                let mut scratch = data.to_vec();
                if let Err(err) = repacker.repack(&mut scratch) {
                    return Err(self.malformed(err));
                }
                repacked = scratch;
                (&repacked, false)
            }
            Some(_) => (data, true),
            None => (data, false),
        };

        let deadline = Instant::now() + self.config.input_deadline;
        let mut offset = 0;
        loop {
            let mut header = self.next_input_buffer(deadline)?;
            let rest = &unit[offset..];
            let copied = header.fill_from(rest);
            if copied == 0 && !rest.is_empty() {
                self.input.put_back(header);
                return Err(ComponentError::BadParameter(
                    "input buffers have no capacity".into(),
                ));
            }
            offset += copied;
            let last = offset >= unit.len();
            if repack_in_place
                && let Some(repacker) = self.repacker
                && let Err(err) = repacker.repack(header.payload_mut())
            {
                self.input.put_back(header);
                return Err(self.malformed(err));
            }
            header.timestamp = timestamp;
            header.flags = flags;
            header.flags.set(BufferFlags::END_OF_FRAME, last);
            if !last {
                header.flags.remove(BufferFlags::END_OF_STREAM);
            }
            self.empty(header)?;
            self.input.set_flushed(false);
            if last {
                break;
            }
        }
        self.stats.inputs += 1;
        self.consecutive_timeouts = 0;
        Ok(())
    }

    fn malformed(&mut self, err: RepackError) -> ComponentError {
        self.stats.dropped_units += 1;
        warn!(component = %self.name, %err, "dropping malformed unit");
        ComponentError::MalformedInput(err)
    }

    // Waits in bounded steps for a free input buffer, servicing output and pending
    // reconfiguration in between.
    fn next_input_buffer(&mut self, deadline: Instant) -> Result<BufferHeader> {
        loop {
            if self.output.reconfigure_pending() {
                self.reconfigure_output().map_err(|e| self.fail(e))?;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.input_timeout());
            }
            let step = remaining.min(self.config.input_wait_step);
            match self.input.fifo().get_timeout(step) {
                Some(FifoItem::Buffer(header)) => return Ok(header),
                Some(FifoItem::Sentinel) => {
                    debug!(component = %self.name, "input woken for reconfiguration");
                }
                None => {
                    self.pump_events()?;
                    self.service_output()?;
                }
            }
        }
    }

    fn input_timeout(&mut self) -> ComponentError {
        self.consecutive_timeouts += 1;
        self.stats.timeouts += 1;
        let err = ComponentError::Timeout {
            waiting_for: "free input buffer".into(),
        };
        warn!(
            component = %self.name,
            consecutive = self.consecutive_timeouts,
            "no input buffer before deadline"
        );
        if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
            return self.fail(err);
        }
        err
    }

    fn empty(&mut self, header: BufferHeader) -> Result<()> {
        let Some(component) = self.component.as_deref_mut() else {
            self.input.put_back(header);
            return Err(ComponentError::InvalidState {
                operation: "empty buffer",
                state: self.state,
            });
        };
        self.input.hand_to_native(header.id());
        match component.empty_this_buffer(header) {
            Ok(()) => Ok(()),
            Err(Rejected { code, header }) => {
                self.input.take_back(header);
                Err(ComponentError::native("empty buffer", code))
            }
        }
    }

    fn fill(&mut self, header: BufferHeader) -> Result<()> {
        let Some(component) = self.component.as_deref_mut() else {
            self.output.put_back(header);
            return Err(ComponentError::InvalidState {
                operation: "fill buffer",
                state: self.state,
            });
        };
        self.output.hand_to_native(header.id());
        match component.fill_this_buffer(header) {
            Ok(()) => Ok(()),
            Err(Rejected { code, header }) => {
                self.output.take_back(header);
                Err(ComponentError::native("fill buffer", code))
            }
        }
    }

    /// Flush the input port unless nothing was submitted since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        self.require(SessionState::Executing, "flush")?;
        if self.input.is_flushed() {
            return Ok(());
        }
        let index = self.input.index();
        debug!(component = %self.name, port = index, "flushing input");
        self.input.set_flushed(true);
        self.stats.flushes += 1;
        self.send_and_wait(Command::Flush(index))
    }

    /// Next converted output unit, without blocking.
    pub fn poll_output(&mut self) -> Result<Option<OutputUnit>> {
        self.check_running("poll output")?;
        if self.ready.is_empty() {
            self.service_output()?;
        }
        Ok(self.ready.pop_front())
    }

    /// Like [`ComponentSession::poll_output`], waiting up to `timeout` for a unit.
    pub fn poll_output_timeout(&mut self, timeout: Duration) -> Result<Option<OutputUnit>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(unit) = self.poll_output()? {
                return Ok(Some(unit));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let step = remaining.min(self.config.output_wait_step);
            if let Some(item) = self.output.fifo().get_timeout(step) {
                self.output_item(item)?;
            }
        }
    }

    fn service_output(&mut self) -> Result<()> {
        if self.output.reconfigure_pending() {
            self.reconfigure_output().map_err(|e| self.fail(e))?;
        }
        if !self.output.is_enabled() {
            return Ok(());
        }
        while let Some(item) = self.output.fifo().try_get() {
            self.output_item(item)?;
        }
        Ok(())
    }

    // Converts a filled output buffer, if any content, and hands it back to be filled.
    fn output_item(&mut self, item: FifoItem) -> Result<()> {
        let FifoItem::Buffer(mut header) = item else {
            return Ok(());
        };
        if self.output.take_format_refresh()
            && let Err(err) = self.refresh_output()
        {
            self.output.put_back(header);
            return Err(self.fail(err));
        }
        if !header.is_empty() {
            self.collect(&header);
        }
        header.clear();
        self.fill(header)
    }

    fn collect(&mut self, header: &BufferHeader) {
        let layout = match (self.kind, self.output.kind()) {
            (CodecKind::Decoder, MediaKind::Video) => self.output.layout(),
            _ => None,
        };
        let data = match layout {
            Some(layout) => match self.converter.convert(&layout, header.payload()) {
                Ok(data) => data,
                Err(err) => {
                    warn!(component = %self.name, %err, "dropping unconvertible frame");
                    return;
                }
            },
            None => header.payload().to_vec(),
        };
        self.stats.outputs += 1;
        self.ready.push_back(OutputUnit {
            data,
            timestamp: header.timestamp,
            flags: header.flags,
        });
    }

    // Disable, drain and re-enable the output port after a settings change.
    fn reconfigure_output(&mut self) -> Result<()> {
        self.output.clear_reconfigure();
        let index = self.output.index();
        let timeout = self.config.command_timeout;
        info!(component = %self.name, port = index, "reconfiguring output port");

        let component = component_of(&mut self.component)?;
        let fresh = component
            .port_definition(index)
            .map_err(|code| ComponentError::native("get port definition", code))?;
        if let Some(video) = fresh.video()
            && (video.width == 0 || video.height == 0)
        {
            return Err(ComponentError::NegotiationFailed {
                port: index,
                reason: "new geometry is empty".into(),
            });
        }

        self.send(Command::PortDisable(index))?;
        let component = component_of(&mut self.component)?;
        self.output.free_buffers(&mut **component, timeout)?;
        self.await_command(Command::PortDisable(index))?;
        self.output.set_enabled(false);

        let component = component_of(&mut self.component)?;
        let def = self
            .negotiator
            .refresh(&**component, index, self.output.format_mut())?;
        if self.output.kind() == MediaKind::Video {
            component
                .set_port_definition(&fresh)
                .map_err(|code| ComponentError::native("set port definition", code))?;
        }
        self.output.set_definition(def);

        self.send(Command::PortEnable(index))?;
        let component = component_of(&mut self.component)?;
        self.output.allocate(&mut **component)?;
        self.await_command(Command::PortEnable(index))?;
        self.output.set_enabled(true);
        self.stats.reconfigurations += 1;
        info!(
            component = %self.name,
            port = index,
            codec = %self.output.format().codec,
            "output port reconfigured"
        );
        Ok(())
    }

    /// Tear the component down. Failures are logged, never returned.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(mut component) = self.component.take() else {
            return;
        };
        self.outstanding = None;
        let timeout = self.config.command_timeout;

        if matches!(
            component.state(),
            Ok(ComponentState::Executing | ComponentState::Pause)
        ) {
            self.teardown_command(&mut *component, ComponentState::Idle);
            let held = self.input.native_owned() + self.output.native_owned();
            if held > 0 {
                warn!(component = %self.name, held, "buffers still native-owned after idle");
            }
        }

        let native = component.state();
        let pools = self.input.pool_size() + self.output.pool_size();
        if native == Ok(ComponentState::Idle) || pools > 0 {
            let loaded = Command::StateSet(ComponentState::Loaded);
            match component.send_command(loaded) {
                Ok(()) => {
                    for port in [&mut self.input, &mut self.output] {
                        if let Err(err) = port.free_buffers(&mut *component, timeout) {
                            warn!(component = %self.name, %err, "freeing buffers failed");
                        }
                    }
                    self.teardown_wait(loaded);
                }
                Err(code) => {
                    warn!(component = %self.name, %code, "loaded request refused");
                }
            }
        }

        let stranded = self.input.abandon(Some(&mut *component))
            + self.output.abandon(Some(&mut *component));
        if stranded > 0 {
            warn!(component = %self.name, stranded, "releasing buffers with the handle");
        }
        if let Err(code) = self.backend.free_handle(component) {
            warn!(component = %self.name, %code, "free handle failed");
        }
        self.events.clear();
        self.ready.clear();
        self.state = SessionState::Unloaded;
        self.core.take();
        info!(component = %self.name, "component unloaded");
    }

    fn teardown_command(&mut self, component: &mut dyn NativeComponent, state: ComponentState) {
        let command = Command::StateSet(state);
        match component.send_command(command) {
            Ok(()) => self.teardown_wait(command),
            Err(code) => warn!(component = %self.name, %command, %code, "teardown command refused"),
        }
    }

    // Flush completions and other stale events are skipped.
    fn teardown_wait(&mut self, command: Command) {
        let outcome = self.events.wait_for(
            |event| matches!(event, ComponentEvent::CommandComplete(done) if *done == command),
            self.config.command_timeout,
        );
        if outcome.is_timeout() {
            warn!(component = %self.name, %command, "teardown command timed out");
        }
    }
}

impl Drop for ComponentSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ComponentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSession")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("input", &self.input.index())
            .field("output", &self.output.index())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_flags_output_and_wakes_input() {
        let events = Arc::new(EventQueue::new());
        let input = Arc::new(PortShared::new());
        let output = Arc::new(PortShared::new());
        let sink = CallbackSink {
            events: Arc::clone(&events),
            input: Arc::clone(&input),
            output: Arc::clone(&output),
        };
        sink.on_event(ComponentEvent::PortSettingsChanged {
            port: 1,
            reason: SettingsReason::PortDefinition,
        });
        assert!(
            output
                .reconfigure_pending
                .load(std::sync::atomic::Ordering::Acquire)
        );
        assert!(matches!(input.fifo.try_get(), Some(FifoItem::Sentinel)));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn crop_change_only_marks_refresh() {
        let events = Arc::new(EventQueue::new());
        let mut port = Port::new(PortDirection::Output, EsFormat::video(codes::I420, 2, 2));
        port.bind(1);
        let input = Arc::new(PortShared::new());
        let sink = CallbackSink {
            events,
            input: Arc::clone(&input),
            output: Arc::clone(port.shared()),
        };
        sink.on_event(ComponentEvent::PortSettingsChanged {
            port: 1,
            reason: SettingsReason::OutputCrop,
        });
        assert!(!port.reconfigure_pending());
        assert!(port.take_format_refresh());
        assert!(input.fifo.is_empty());
    }

    #[test]
    fn request_codec_follows_direction() {
        let request = SessionRequest {
            kind: CodecKind::Encoder,
            input: EsFormat::video(codes::I420, 16, 16),
            output: EsFormat::video(codes::H264, 16, 16),
            config: SessionConfig::default(),
        };
        assert_eq!(request.codec(), codes::H264);
        assert_eq!(request.config.max_consecutive_timeouts, 3);
    }
}
