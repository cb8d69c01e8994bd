//! Simulated component: configuration calls are answered synchronously, commands and
//! buffers are processed on a worker thread that reports back through the callbacks.
use std::{
    collections::VecDeque,
    ops::Range,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_queue::SegQueue;
use ilkit_component::native::{
    AudioCoding, AudioPortFormat, AudioPortParams, ColorFormat, Command, ComponentEvent,
    ComponentState, ErrorCode, NativeCallbacks, NativeComponent, PortDefinition, PortDirection,
    PortFormat, Rejected, SettingsReason, VideoCoding, VideoPortFormat,
};
use ilkit_core::prelude::{BufferFlags, BufferHeader, BufferId, Crop, MediaKind};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{VirtualComponentSpec, VirtualStats};

const INPUT: usize = 0;
const OUTPUT: usize = 1;
const PCM_FRAME_SAMPLES: usize = 1024;

enum Message {
    Command(Command),
    Empty(BufferHeader),
    Fill(BufferHeader),
    /// Buffers were allocated or freed; pending commands may now complete.
    Poke,
    Shutdown,
}

enum Outgoing {
    Event(ComponentEvent),
    EmptyDone(BufferHeader),
    FillDone(BufferHeader),
}

struct Due {
    timestamp: i64,
    flags: BufferFlags,
    len: usize,
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align).saturating_mul(align)
}

fn video_coding(codec: &str) -> VideoCoding {
    match codec {
        "mpeg2" => VideoCoding::Mpeg2,
        "mpeg4" => VideoCoding::Mpeg4,
        "h263" => VideoCoding::H263,
        "avc" => VideoCoding::Avc,
        "hevc" => VideoCoding::Hevc,
        "wmv" => VideoCoding::Wmv,
        "rv" => VideoCoding::Rv,
        "vp8" => VideoCoding::Vp8,
        "vp9" => VideoCoding::Vp9,
        "jpeg" => VideoCoding::Mjpeg,
        _ => VideoCoding::Other(0),
    }
}

fn audio_coding(codec: &str) -> AudioCoding {
    match codec {
        "aac" => AudioCoding::Aac,
        "mp3" => AudioCoding::Mp3,
        "amrnb" | "amrwb" => AudioCoding::Amr,
        "vorbis" => AudioCoding::Vorbis,
        "pcm" => AudioCoding::Pcm,
        _ => AudioCoding::Other(0),
    }
}

fn raw_color_supported(color: ColorFormat) -> bool {
    matches!(
        color,
        ColorFormat::Yuv420Planar
            | ColorFormat::Yuv420SemiPlanar
            | ColorFormat::Yvu420SemiPlanar
            | ColorFormat::YCbYCr
            | ColorFormat::YCrYCb
            | ColorFormat::CbYCrY
            | ColorFormat::CrYCbY
    )
}

/// Port layout implied by a role such as `video_decoder.avc`.
fn ports_for_role(spec: &VirtualComponentSpec, role: &str) -> (MediaKind, bool, [PortDefinition; 2]) {
    let (class, codec) = role.split_once('.').unwrap_or((role, ""));
    let media = if class.starts_with("audio") {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    let encoder = class.ends_with("encoder");
    let port = |index: usize, format| PortDefinition {
        index: index as u32,
        direction: if index == INPUT {
            PortDirection::Input
        } else {
            PortDirection::Output
        },
        enabled: true,
        populated: false,
        buffer_count_actual: spec.buffer_count,
        buffer_count_min: spec.buffer_count.min(2),
        buffer_size: spec.min_buffer_size,
        format,
    };
    let compressed_side = if encoder { OUTPUT } else { INPUT };
    let formats: [PortFormat; 2] = std::array::from_fn(|index| match media {
        MediaKind::Video => PortFormat::Video(VideoPortFormat {
            compression: if index == compressed_side {
                video_coding(codec)
            } else {
                VideoCoding::Unused
            },
            color: if index == compressed_side {
                ColorFormat::Unused
            } else {
                ColorFormat::Yuv420Planar
            },
            width: 176,
            height: 144,
            framerate: 30 << 16,
            ..VideoPortFormat::default()
        }),
        MediaKind::Audio => PortFormat::Audio(AudioPortFormat {
            encoding: if index == compressed_side {
                audio_coding(codec)
            } else {
                AudioCoding::Pcm
            },
        }),
    });
    let [input, output] = formats;
    (media, encoder, [port(INPUT, input), port(OUTPUT, output)])
}

struct Inner {
    spec: VirtualComponentSpec,
    stats: Arc<VirtualStats>,
    state: ComponentState,
    media: MediaKind,
    encoder: bool,
    ports: [PortDefinition; 2],
    audio: [AudioPortParams; 2],
    allocated: [u32; 2],
    next_id: u32,
    held: [VecDeque<BufferHeader>; 2],
    due: VecDeque<Due>,
    pending: Vec<Command>,
    inputs: u32,
    produced: u64,
    settings_fired: bool,
    awaiting_reconfigure: bool,
}

impl Inner {
    fn new(spec: VirtualComponentSpec, stats: Arc<VirtualStats>) -> Self {
        let role = spec.roles.first().cloned().unwrap_or_default();
        let (media, encoder, ports) = ports_for_role(&spec, &role);
        let params = |encoding| AudioPortParams {
            encoding,
            channels: 2,
            rate: 44_100,
            bitrate: 0,
            bits_per_sample: 16,
            block_align: 0,
        };
        let audio = [
            params(ports[INPUT].audio().map_or(AudioCoding::Unused, |a| a.encoding)),
            params(ports[OUTPUT].audio().map_or(AudioCoding::Unused, |a| a.encoding)),
        ];
        let mut inner = Self {
            spec,
            stats,
            state: ComponentState::Loaded,
            media,
            encoder,
            ports,
            audio,
            allocated: [0; 2],
            next_id: 0,
            held: [VecDeque::new(), VecDeque::new()],
            due: VecDeque::new(),
            pending: Vec::new(),
            inputs: 0,
            produced: 0,
            settings_fired: false,
            awaiting_reconfigure: false,
        };
        inner.recompute(INPUT);
        inner.recompute(OUTPUT);
        inner
    }

    fn port(port: u32) -> Result<usize, ErrorCode> {
        match port {
            0 => Ok(INPUT),
            1 => Ok(OUTPUT),
            _ => Err(ErrorCode::BadPortIndex),
        }
    }

    // Idempotent projection of a port onto what the component can do.
    fn recompute(&mut self, port: usize) {
        let align = self.spec.stride_align.max(1);
        let min = self.spec.min_buffer_size;
        let def = &mut self.ports[port];
        def.buffer_count_actual = def.buffer_count_actual.max(def.buffer_count_min);
        let floor = match &mut def.format {
            PortFormat::Video(vf) if vf.compression == VideoCoding::Unused => {
                vf.stride = align_up((vf.stride.max(0) as u32).max(vf.width), align) as i32;
                vf.slice_height = align_up(vf.height, 16);
                let luma = vf.stride as u32 * vf.slice_height;
                match vf.color {
                    ColorFormat::YCbYCr
                    | ColorFormat::YCrYCb
                    | ColorFormat::CbYCrY
                    | ColorFormat::CrYCbY => luma,
                    _ => luma + luma / 2,
                }
            }
            _ => 0,
        };
        def.buffer_size = def.buffer_size.max(min).max(floor);
        def.populated = self.allocated[port] >= def.buffer_count_actual;
    }

    fn set_role(&mut self, role: &str) -> Result<(), ErrorCode> {
        if self.state != ComponentState::Loaded {
            return Err(ErrorCode::IncorrectStateOperation);
        }
        if !self.spec.roles.iter().any(|r| r == role) {
            return Err(ErrorCode::UnsupportedSetting);
        }
        let (media, encoder, ports) = ports_for_role(&self.spec, role);
        self.media = media;
        self.encoder = encoder;
        self.ports = ports;
        self.recompute(INPUT);
        self.recompute(OUTPUT);
        Ok(())
    }

    fn set_port_definition(&mut self, def: &PortDefinition) -> Result<(), ErrorCode> {
        let port = Self::port(def.index)?;
        let current = &mut self.ports[port];
        if self.state != ComponentState::Loaded && current.enabled {
            return Err(ErrorCode::IncorrectStateOperation);
        }
        if self.spec.refuse_definitions {
            return Err(ErrorCode::UnsupportedSetting);
        }
        if def.direction != current.direction {
            return Err(ErrorCode::BadParameter);
        }
        match (&mut current.format, &def.format) {
            (PortFormat::Video(cur), PortFormat::Video(new)) => {
                if cur.compression == VideoCoding::Unused {
                    if !raw_color_supported(new.color) {
                        return Err(ErrorCode::UnsupportedSetting);
                    }
                    cur.color = new.color;
                    cur.stride = new.stride;
                } else if new.compression != cur.compression {
                    return Err(ErrorCode::UnsupportedSetting);
                }
                cur.width = new.width;
                cur.height = new.height;
                cur.framerate = new.framerate;
                cur.bitrate = new.bitrate;
            }
            (PortFormat::Audio(cur), PortFormat::Audio(new)) => {
                if new.encoding != cur.encoding {
                    return Err(ErrorCode::UnsupportedSetting);
                }
            }
            _ => return Err(ErrorCode::BadParameter),
        }
        current.buffer_count_actual = def.buffer_count_actual;
        current.buffer_size = def.buffer_size;
        self.recompute(port);
        Ok(())
    }

    fn allocate(&mut self, port: u32, size: usize) -> Result<BufferHeader, ErrorCode> {
        let index = Self::port(port)?;
        let def = &self.ports[index];
        if size < def.buffer_size as usize {
            return Err(ErrorCode::BadParameter);
        }
        if self.allocated[index] >= def.buffer_count_actual {
            return Err(ErrorCode::InsufficientResources);
        }
        let header = BufferHeader::new(BufferId(self.next_id), port, size);
        self.next_id += 1;
        self.allocated[index] += 1;
        self.ports[index].populated = self.allocated[index] >= self.ports[index].buffer_count_actual;
        self.stats.buffer_allocated();
        Ok(header)
    }

    fn free(&mut self, port: u32, header: BufferHeader) -> Result<(), ErrorCode> {
        let index = Self::port(port)?;
        if header.port() != port || self.allocated[index] == 0 {
            return Err(ErrorCode::BadParameter);
        }
        self.allocated[index] -= 1;
        self.ports[index].populated = false;
        self.stats.buffer_freed();
        Ok(())
    }

    fn handle(&mut self, message: Message, out: &mut Vec<Outgoing>) {
        match message {
            Message::Command(command) => self.command(command, out),
            Message::Empty(header) => self.empty(header, out),
            Message::Fill(header) => self.fill(header, out),
            Message::Poke | Message::Shutdown => {}
        }
        self.settle(out);
        self.produce(out);
    }

    fn complete(command: Command, out: &mut Vec<Outgoing>) {
        out.push(Outgoing::Event(ComponentEvent::CommandComplete(command)));
    }

    fn command(&mut self, command: Command, out: &mut Vec<Outgoing>) {
        trace!(component = %self.spec.name, %command, "command received");
        match command {
            Command::StateSet(target) => self.transition(target, out),
            Command::Flush(port) => {
                self.return_held(port as usize, out);
                if port as usize == OUTPUT {
                    self.due.clear();
                }
                self.stats.flushed();
                Self::complete(command, out);
            }
            Command::PortDisable(port) => {
                let index = port as usize;
                self.ports[index].enabled = false;
                self.return_held(index, out);
                self.pending.push(command);
            }
            Command::PortEnable(port) => {
                self.ports[port as usize].enabled = true;
                if self.state == ComponentState::Loaded {
                    Self::complete(command, out);
                } else {
                    self.pending.push(command);
                }
            }
        }
    }

    fn transition(&mut self, target: ComponentState, out: &mut Vec<Outgoing>) {
        if self.spec.hang_on == Some(target) {
            debug!(component = %self.spec.name, ?target, "holding state transition");
            return;
        }
        let command = Command::StateSet(target);
        match (self.state, target) {
            (ComponentState::Loaded, ComponentState::Idle) => self.pending.push(command),
            (ComponentState::Loaded, ComponentState::Loaded) => {
                self.pending
                    .retain(|c| *c != Command::StateSet(ComponentState::Idle));
                self.pending.push(command);
            }
            (ComponentState::Idle, ComponentState::Loaded) => {
                self.return_held(INPUT, out);
                self.return_held(OUTPUT, out);
                self.pending.push(command);
            }
            (ComponentState::Idle | ComponentState::Pause, ComponentState::Executing)
            | (ComponentState::Idle | ComponentState::Executing, ComponentState::Pause) => {
                self.state = target;
                Self::complete(command, out);
            }
            (ComponentState::Executing | ComponentState::Pause, ComponentState::Idle) => {
                self.return_held(INPUT, out);
                self.return_held(OUTPUT, out);
                self.due.clear();
                self.state = target;
                Self::complete(command, out);
            }
            (from, to) => {
                warn!(component = %self.spec.name, ?from, ?to, "refusing state transition");
                out.push(Outgoing::Event(ComponentEvent::Error {
                    code: ErrorCode::IncorrectStateTransition,
                    detail: 0,
                }));
            }
        }
    }

    fn return_held(&mut self, port: usize, out: &mut Vec<Outgoing>) {
        while let Some(mut header) = self.held[port].pop_front() {
            if port == INPUT {
                out.push(Outgoing::EmptyDone(header));
            } else {
                header.clear();
                out.push(Outgoing::FillDone(header));
            }
        }
    }

    fn ready(&self, command: Command) -> bool {
        let populated = |i: usize| self.allocated[i] >= self.ports[i].buffer_count_actual;
        match command {
            Command::StateSet(ComponentState::Idle) => {
                (0..2).all(|i| !self.ports[i].enabled || populated(i))
            }
            Command::StateSet(ComponentState::Loaded) => self.allocated == [0, 0],
            Command::PortDisable(port) => self.allocated[port as usize] == 0,
            Command::PortEnable(port) => populated(port as usize),
            _ => true,
        }
    }

    fn settle(&mut self, out: &mut Vec<Outgoing>) {
        for command in std::mem::take(&mut self.pending) {
            if !self.ready(command) {
                self.pending.push(command);
                continue;
            }
            match command {
                Command::StateSet(state) => self.state = state,
                Command::PortEnable(port) if port as usize == OUTPUT => {
                    self.awaiting_reconfigure = false;
                }
                _ => {}
            }
            debug!(component = %self.spec.name, %command, "command complete");
            Self::complete(command, out);
        }
    }

    fn empty(&mut self, mut header: BufferHeader, out: &mut Vec<Outgoing>) {
        if self.state != ComponentState::Executing || !self.ports[INPUT].enabled {
            self.held[INPUT].push_back(header);
            return;
        }
        if header.flags.contains(BufferFlags::CODEC_CONFIG) {
            self.stats.codec_config(
                header.payload(),
                header.flags.contains(BufferFlags::END_OF_FRAME),
            );
            header.clear();
            out.push(Outgoing::EmptyDone(header));
            return;
        }
        self.inputs += 1;
        self.stats.input();
        if let Some(every) = self.spec.corrupt_every
            && self.inputs % every == 0
        {
            out.push(Outgoing::Event(ComponentEvent::Error {
                code: ErrorCode::StreamCorrupt,
                detail: self.inputs,
            }));
        }
        if let Some(change) = self.spec.settings_change
            && !self.settings_fired
            && self.inputs >= change.after_inputs
        {
            self.change_output_geometry(change.width, change.height);
            out.push(Outgoing::Event(ComponentEvent::PortSettingsChanged {
                port: OUTPUT as u32,
                reason: SettingsReason::PortDefinition,
            }));
        }
        if header.flags.contains(BufferFlags::END_OF_FRAME) {
            self.due.push_back(Due {
                timestamp: header.timestamp,
                flags: header.flags & BufferFlags::END_OF_STREAM,
                len: header.filled_len(),
            });
        }
        header.clear();
        out.push(Outgoing::EmptyDone(header));
    }

    fn change_output_geometry(&mut self, width: u32, height: u32) {
        self.settings_fired = true;
        self.awaiting_reconfigure = true;
        self.stats.settings_changed();
        let def = &mut self.ports[OUTPUT];
        if let PortFormat::Video(vf) = &mut def.format {
            vf.width = width;
            vf.height = height;
            vf.stride = 0;
        }
        def.buffer_size = 0;
        self.recompute(OUTPUT);
        debug!(component = %self.spec.name, width, height, "output geometry changed");
    }

    fn fill(&mut self, mut header: BufferHeader, out: &mut Vec<Outgoing>) {
        if !self.ports[OUTPUT].enabled {
            header.clear();
            out.push(Outgoing::FillDone(header));
            return;
        }
        self.held[OUTPUT].push_back(header);
    }

    fn frame_len(&self, input_len: usize) -> usize {
        match (self.media, self.encoder) {
            (_, true) => input_len / 8 + 16,
            (MediaKind::Video, false) => match self.ports[OUTPUT].video() {
                Some(vf) => {
                    let luma = vf.stride.max(0) as usize * vf.slice_height as usize;
                    luma + luma / 2
                }
                None => input_len,
            },
            (MediaKind::Audio, false) => {
                let params = &self.audio[OUTPUT];
                PCM_FRAME_SAMPLES * usize::from(params.channels.max(1)) * 2
            }
        }
    }

    // Decoded frames go out as patterned payloads, one per completed input unit.
    fn produce(&mut self, out: &mut Vec<Outgoing>) {
        while self.state == ComponentState::Executing
            && !self.awaiting_reconfigure
            && self.ports[OUTPUT].enabled
            && !self.due.is_empty()
            && let Some(mut header) = self.held[OUTPUT].pop_front()
        {
            let Some(due) = self.due.pop_front() else {
                self.held[OUTPUT].push_front(header);
                break;
            };
            let len = self.frame_len(due.len).min(header.capacity());
            let fill = (self.produced % 256) as u8;
            header.storage_mut()[..len].fill(fill);
            header.set_range(0, len);
            header.timestamp = due.timestamp;
            header.flags = due.flags | BufferFlags::END_OF_FRAME;
            self.produced += 1;
            self.stats.output();
            out.push(Outgoing::FillDone(header));
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    mailbox: SegQueue<Message>,
}

fn run(shared: Arc<Shared>, callbacks: Arc<dyn NativeCallbacks>) {
    let mut out = Vec::new();
    loop {
        while let Some(message) = shared.mailbox.pop() {
            if matches!(message, Message::Shutdown) {
                return;
            }
            shared.inner.lock().handle(message, &mut out);
            for outgoing in out.drain(..) {
                match outgoing {
                    Outgoing::Event(event) => callbacks.on_event(event),
                    Outgoing::EmptyDone(header) => callbacks.on_empty_buffer_done(header),
                    Outgoing::FillDone(header) => callbacks.on_fill_buffer_done(header),
                }
            }
        }
        thread::park();
    }
}

/// A simulated component with its worker thread.
///
/// Dropping it stops the worker; no callback runs after the drop returns.
pub struct VirtualComponent {
    name: String,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<VirtualStats>,
}

impl VirtualComponent {
    pub(crate) fn spawn(
        spec: VirtualComponentSpec,
        callbacks: Arc<dyn NativeCallbacks>,
        stats: Arc<VirtualStats>,
    ) -> Result<Self, ErrorCode> {
        let name = spec.name.clone();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new(spec, Arc::clone(&stats))),
            mailbox: SegQueue::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("ilkit-virtual:{name}"))
            .spawn(move || run(worker_shared, callbacks))
            .map_err(|err| {
                warn!(component = %name, %err, "failed to spawn virtual worker");
                ErrorCode::InsufficientResources
            })?;
        Ok(Self {
            name,
            shared,
            worker: Some(worker),
            stats,
        })
    }

    fn post(&self, message: Message) {
        self.shared.mailbox.push(message);
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
    }
}

impl NativeComponent for VirtualComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_role(&mut self, role: &str) -> Result<(), ErrorCode> {
        self.shared.inner.lock().set_role(role)
    }

    fn ports(&self, kind: MediaKind) -> Result<Range<u32>, ErrorCode> {
        if self.shared.inner.lock().media == kind {
            Ok(0..2)
        } else {
            Ok(0..0)
        }
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition, ErrorCode> {
        let inner = self.shared.inner.lock();
        Ok(inner.ports[Inner::port(port)?])
    }

    fn set_port_definition(&mut self, definition: &PortDefinition) -> Result<(), ErrorCode> {
        self.shared.inner.lock().set_port_definition(definition)
    }

    fn audio_params(&self, port: u32) -> Result<AudioPortParams, ErrorCode> {
        let inner = self.shared.inner.lock();
        if inner.media != MediaKind::Audio {
            return Err(ErrorCode::UnsupportedIndex);
        }
        Ok(inner.audio[Inner::port(port)?])
    }

    fn set_audio_params(&mut self, port: u32, params: &AudioPortParams) -> Result<(), ErrorCode> {
        let mut inner = self.shared.inner.lock();
        let index = Inner::port(port)?;
        if inner.media != MediaKind::Audio || params.encoding != inner.audio[index].encoding {
            return Err(ErrorCode::UnsupportedSetting);
        }
        if params.channels == 0 {
            return Err(ErrorCode::BadParameter);
        }
        inner.audio[index] = *params;
        Ok(())
    }

    fn output_crop(&self, port: u32) -> Result<Crop, ErrorCode> {
        let inner = self.shared.inner.lock();
        let def = &inner.ports[Inner::port(port)?];
        match (def.direction, def.video()) {
            (PortDirection::Output, Some(vf)) if vf.compression == VideoCoding::Unused => {
                Ok(Crop {
                    left: 0,
                    top: 0,
                    width: vf.width,
                    height: vf.height,
                })
            }
            _ => Err(ErrorCode::UnsupportedIndex),
        }
    }

    fn state(&self) -> Result<ComponentState, ErrorCode> {
        Ok(self.shared.inner.lock().state)
    }

    fn send_command(&mut self, command: Command) -> Result<(), ErrorCode> {
        if let Command::Flush(port) | Command::PortDisable(port) | Command::PortEnable(port) =
            command
        {
            Inner::port(port)?;
        }
        self.post(Message::Command(command));
        Ok(())
    }

    fn allocate_buffer(&mut self, port: u32, size: usize) -> Result<BufferHeader, ErrorCode> {
        let header = self.shared.inner.lock().allocate(port, size)?;
        self.post(Message::Poke);
        Ok(header)
    }

    fn free_buffer(&mut self, port: u32, header: BufferHeader) -> Result<(), ErrorCode> {
        self.shared.inner.lock().free(port, header)?;
        self.post(Message::Poke);
        Ok(())
    }

    fn empty_this_buffer(&mut self, header: BufferHeader) -> Result<(), Rejected> {
        let state = self.shared.inner.lock().state;
        if header.port() != INPUT as u32 {
            return Err(Rejected {
                code: ErrorCode::BadPortIndex,
                header,
            });
        }
        if state == ComponentState::Loaded {
            return Err(Rejected {
                code: ErrorCode::IncorrectStateOperation,
                header,
            });
        }
        self.post(Message::Empty(header));
        Ok(())
    }

    fn fill_this_buffer(&mut self, header: BufferHeader) -> Result<(), Rejected> {
        let state = self.shared.inner.lock().state;
        if header.port() != OUTPUT as u32 {
            return Err(Rejected {
                code: ErrorCode::BadPortIndex,
                header,
            });
        }
        if state == ComponentState::Loaded {
            return Err(Rejected {
                code: ErrorCode::IncorrectStateOperation,
                header,
            });
        }
        self.post(Message::Fill(header));
        Ok(())
    }
}

impl Drop for VirtualComponent {
    fn drop(&mut self) {
        self.post(Message::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(component = %self.name, "virtual worker panicked");
        }
        self.stats.handle_closed();
    }
}

impl std::fmt::Debug for VirtualComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualComponent")
            .field("name", &self.name)
            .field("state", &self.shared.inner.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    enum Seen {
        Event(ComponentEvent),
        Empty(BufferHeader),
        Fill(BufferHeader),
    }

    struct Channel(Mutex<mpsc::Sender<Seen>>);

    impl NativeCallbacks for Channel {
        fn on_event(&self, event: ComponentEvent) {
            let _ = self.0.lock().send(Seen::Event(event));
        }
        fn on_empty_buffer_done(&self, header: BufferHeader) {
            let _ = self.0.lock().send(Seen::Empty(header));
        }
        fn on_fill_buffer_done(&self, header: BufferHeader) {
            let _ = self.0.lock().send(Seen::Fill(header));
        }
    }

    fn component(spec: VirtualComponentSpec) -> (VirtualComponent, mpsc::Receiver<Seen>, Arc<VirtualStats>) {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(VirtualStats::default());
        let handle =
            VirtualComponent::spawn(spec, Arc::new(Channel(Mutex::new(tx))), Arc::clone(&stats))
                .unwrap();
        (handle, rx, stats)
    }

    fn next(rx: &mpsc::Receiver<Seen>) -> Seen {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    fn expect_complete(rx: &mpsc::Receiver<Seen>, command: Command) {
        match next(rx) {
            Seen::Event(ComponentEvent::CommandComplete(done)) => assert_eq!(done, command),
            _ => panic!("expected completion of {command}"),
        }
    }

    fn populate(c: &mut VirtualComponent, port: u32) -> Vec<BufferHeader> {
        let def = c.port_definition(port).unwrap();
        (0..def.buffer_count_actual)
            .map(|_| c.allocate_buffer(port, def.buffer_size as usize).unwrap())
            .collect()
    }

    #[test]
    fn definition_writes_are_idempotent() {
        let (mut c, _rx, _) = component(
            VirtualComponentSpec::new("OMX.virtual.avc", ["video_decoder.avc"]).with_stride_align(64),
        );
        c.set_role("video_decoder.avc").unwrap();
        let mut def = c.port_definition(1).unwrap();
        def.video_mut().unwrap().width = 100;
        def.video_mut().unwrap().height = 50;
        def.video_mut().unwrap().stride = 100;
        c.set_port_definition(&def).unwrap();
        let first = c.port_definition(1).unwrap();
        assert_eq!(first.video().unwrap().stride, 128);
        assert_eq!(first.video().unwrap().slice_height, 64);
        c.set_port_definition(&first).unwrap();
        assert_eq!(c.port_definition(1).unwrap(), first);
    }

    #[test]
    fn idle_waits_for_population() {
        let spec = VirtualComponentSpec::new("OMX.virtual.aac", ["audio_decoder.aac"]).with_buffers(2, 1024);
        let (mut c, rx, stats) = component(spec);
        c.set_role("audio_decoder.aac").unwrap();
        let idle = Command::StateSet(ComponentState::Idle);
        c.send_command(idle).unwrap();
        let mut buffers = populate(&mut c, 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        buffers.extend(populate(&mut c, 1));
        expect_complete(&rx, idle);
        assert_eq!(stats.live_buffers(), 4);

        let loaded = Command::StateSet(ComponentState::Loaded);
        c.send_command(loaded).unwrap();
        for header in buffers {
            let port = header.port();
            c.free_buffer(port, header).unwrap();
        }
        expect_complete(&rx, loaded);
        assert_eq!(stats.live_buffers(), 0);
    }

    #[test]
    fn executing_decodes_and_idle_returns_buffers() {
        let spec = VirtualComponentSpec::new("OMX.virtual.avc", ["video_decoder.avc"]).with_buffers(2, 4096);
        let (mut c, rx, _) = component(spec);
        c.set_role("video_decoder.avc").unwrap();
        let idle = Command::StateSet(ComponentState::Idle);
        c.send_command(idle).unwrap();
        let mut inputs = populate(&mut c, 0);
        let mut outputs = populate(&mut c, 1);
        expect_complete(&rx, idle);
        let executing = Command::StateSet(ComponentState::Executing);
        c.send_command(executing).unwrap();
        expect_complete(&rx, executing);

        let mut frame = inputs.pop().unwrap();
        frame.fill_from(&[0, 0, 0, 1, 0x65]);
        frame.timestamp = 40_000;
        frame.flags = BufferFlags::END_OF_FRAME;
        c.empty_this_buffer(frame).unwrap();
        c.fill_this_buffer(outputs.pop().unwrap()).unwrap();
        c.fill_this_buffer(outputs.pop().unwrap()).unwrap();

        let mut decoded = None;
        let mut emptied = 0;
        while decoded.is_none() || emptied == 0 {
            match next(&rx) {
                Seen::Empty(_) => emptied += 1,
                Seen::Fill(h) => decoded = Some(h),
                Seen::Event(e) => panic!("unexpected {e:?}"),
            }
        }
        let decoded = decoded.unwrap();
        assert_eq!(decoded.timestamp, 40_000);
        assert!(!decoded.is_empty());

        c.send_command(idle).unwrap();
        match next(&rx) {
            Seen::Fill(h) => assert!(h.is_empty()),
            _ => panic!("held output buffer not returned first"),
        }
        expect_complete(&rx, idle);
    }

    #[test]
    fn hang_never_completes() {
        let spec = VirtualComponentSpec::new("OMX.virtual.mp3", ["audio_decoder.mp3"])
            .hanging_on(ComponentState::Idle);
        let (mut c, rx, _) = component(spec);
        c.send_command(Command::StateSet(ComponentState::Idle)).unwrap();
        populate(&mut c, 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(c.state().unwrap(), ComponentState::Loaded);
    }
}
