//! The asynchronous protocol spoken to vendor codec components.
//!
//! Everything here is a black box reached through [`NativeBackend`] and [`NativeComponent`];
//! completions come back through [`NativeCallbacks`] on threads this crate does not own.
use std::{fmt, ops::Range, sync::Arc};

use ilkit_core::prelude::{BufferFlags, BufferHeader, Crop, MediaKind};

/// State of a native component as reported by the component itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ComponentState {
    Invalid,
    Loaded,
    Idle,
    Executing,
    Pause,
    WaitForResources,
}

/// Commands accepted by [`NativeComponent::send_command`].
///
/// Completion of each command is reported as [`ComponentEvent::CommandComplete`] carrying
/// the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    StateSet(ComponentState),
    Flush(u32),
    PortDisable(u32),
    PortEnable(u32),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StateSet(state) => write!(f, "state-set({state:?})"),
            Command::Flush(port) => write!(f, "flush({port})"),
            Command::PortDisable(port) => write!(f, "port-disable({port})"),
            Command::PortEnable(port) => write!(f, "port-enable({port})"),
        }
    }
}

/// Data direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortDirection {
    Input,
    Output,
}

/// Compression of a video port; `Unused` marks a raw picture port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VideoCoding {
    Unused,
    Mpeg2,
    H263,
    Mpeg4,
    Wmv,
    Rv,
    Avc,
    Mjpeg,
    Vp8,
    Vp9,
    Hevc,
    Other(u32),
}

/// Encoding of an audio port; `Pcm` marks a raw sample port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AudioCoding {
    Unused,
    Pcm,
    Aac,
    Mp3,
    Amr,
    Vorbis,
    Wma,
    Other(u32),
}

/// Raw picture layout of a video port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ColorFormat {
    Unused,
    /// Planar 4:2:0, Y then U then V.
    Yuv420Planar,
    /// Semi-planar 4:2:0, interleaved CbCr.
    Yuv420SemiPlanar,
    /// Semi-planar 4:2:0, interleaved CrCb.
    Yvu420SemiPlanar,
    YCbYCr,
    YCrYCb,
    CbYCrY,
    CrYCbY,
    Vendor(u32),
}

/// Video part of a port definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoPortFormat {
    pub compression: VideoCoding,
    pub color: ColorFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the luma plane; may be zero when the component has no opinion.
    pub stride: i32,
    /// Lines per plane including padding; may be zero.
    pub slice_height: u32,
    /// Frames per second, Q16.
    pub framerate: u32,
    pub bitrate: u32,
}

impl Default for VideoPortFormat {
    fn default() -> Self {
        Self {
            compression: VideoCoding::Unused,
            color: ColorFormat::Unused,
            width: 0,
            height: 0,
            stride: 0,
            slice_height: 0,
            framerate: 0,
            bitrate: 0,
        }
    }
}

/// Audio part of a port definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AudioPortFormat {
    pub encoding: AudioCoding,
}

/// Kind-specific payload of a [`PortDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortFormat {
    Video(VideoPortFormat),
    Audio(AudioPortFormat),
}

/// Native descriptor of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortDefinition {
    pub index: u32,
    pub direction: PortDirection,
    pub enabled: bool,
    pub populated: bool,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: u32,
    pub format: PortFormat,
}

impl PortDefinition {
    pub fn kind(&self) -> MediaKind {
        match self.format {
            PortFormat::Video(_) => MediaKind::Video,
            PortFormat::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn video(&self) -> Option<&VideoPortFormat> {
        match &self.format {
            PortFormat::Video(v) => Some(v),
            PortFormat::Audio(_) => None,
        }
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoPortFormat> {
        match &mut self.format {
            PortFormat::Video(v) => Some(v),
            PortFormat::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioPortFormat> {
        match &self.format {
            PortFormat::Audio(a) => Some(a),
            PortFormat::Video(_) => None,
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioPortFormat> {
        match &mut self.format {
            PortFormat::Audio(a) => Some(a),
            PortFormat::Video(_) => None,
        }
    }
}

/// Encoding-specific audio parameters of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AudioPortParams {
    pub encoding: AudioCoding,
    pub channels: u16,
    pub rate: u32,
    pub bitrate: u32,
    pub bits_per_sample: u16,
    pub block_align: u32,
}

/// Error codes reported by native calls and `Error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("undefined error")]
    Undefined,
    #[error("component not found")]
    ComponentNotFound,
    #[error("invalid component")]
    InvalidComponent,
    #[error("bad parameter")]
    BadParameter,
    #[error("not implemented")]
    NotImplemented,
    #[error("hardware error")]
    Hardware,
    #[error("invalid state")]
    InvalidState,
    #[error("stream corrupt")]
    StreamCorrupt,
    #[error("macroblock errors in frame")]
    MbErrorsInFrame,
    #[error("timeout")]
    Timeout,
    #[error("unsupported setting")]
    UnsupportedSetting,
    #[error("unsupported index")]
    UnsupportedIndex,
    #[error("bad port index")]
    BadPortIndex,
    #[error("incorrect state transition")]
    IncorrectStateTransition,
    #[error("incorrect state operation")]
    IncorrectStateOperation,
    #[error("not ready")]
    NotReady,
    #[error("vendor error 0x{0:08x}")]
    Vendor(u32),
}

impl ErrorCode {
    /// Per-frame damage a decoder reports and then carries on from.
    pub fn is_benign(self) -> bool {
        matches!(self, ErrorCode::StreamCorrupt | ErrorCode::MbErrorsInFrame)
    }
}

/// Why a port's settings changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SettingsReason {
    /// Older components send no index; treated like a definition change.
    Unspecified,
    PortDefinition,
    OutputCrop,
    AudioPcm,
    Other(u32),
}

/// Out-of-band notification delivered through [`NativeCallbacks::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEvent {
    CommandComplete(Command),
    Error { code: ErrorCode, detail: u32 },
    PortSettingsChanged { port: u32, reason: SettingsReason },
    BufferFlag { port: u32, flags: BufferFlags },
    Other { kind: u32, data1: u32, data2: u32 },
}

/// A buffer the component refused synchronously; ownership comes back with the code.
#[derive(Debug)]
pub struct Rejected {
    pub code: ErrorCode,
    pub header: BufferHeader,
}

/// Completion sink handed to a component at load time.
///
/// Called on native threads, concurrently with the control thread. Implementations must
/// only enqueue and signal; they must never call back into the component.
pub trait NativeCallbacks: Send + Sync {
    fn on_event(&self, event: ComponentEvent);
    fn on_empty_buffer_done(&self, header: BufferHeader);
    fn on_fill_buffer_done(&self, header: BufferHeader);
}

/// One loaded native component.
///
/// Calls other than the buffer submissions are synchronous configuration calls; state
/// and port commands complete asynchronously through [`NativeCallbacks::on_event`].
pub trait NativeComponent: Send {
    /// Component name as registered with the native core.
    fn name(&self) -> &str;

    /// Select the standard role (e.g. `video_decoder.avc`).
    fn set_role(&mut self, role: &str) -> Result<(), ErrorCode>;

    /// Port indices serving `kind`; empty when the component has none.
    fn ports(&self, kind: MediaKind) -> Result<Range<u32>, ErrorCode>;

    fn port_definition(&self, port: u32) -> Result<PortDefinition, ErrorCode>;

    fn set_port_definition(&mut self, definition: &PortDefinition) -> Result<(), ErrorCode>;

    fn audio_params(&self, port: u32) -> Result<AudioPortParams, ErrorCode>;

    fn set_audio_params(&mut self, port: u32, params: &AudioPortParams) -> Result<(), ErrorCode>;

    /// Visible window of an output port.
    fn output_crop(&self, _port: u32) -> Result<Crop, ErrorCode> {
        Err(ErrorCode::UnsupportedIndex)
    }

    fn state(&self) -> Result<ComponentState, ErrorCode>;

    fn send_command(&mut self, command: Command) -> Result<(), ErrorCode>;

    fn allocate_buffer(&mut self, port: u32, size: usize) -> Result<BufferHeader, ErrorCode>;

    fn free_buffer(&mut self, port: u32, header: BufferHeader) -> Result<(), ErrorCode>;

    /// Submit a filled input buffer.
    fn empty_this_buffer(&mut self, header: BufferHeader) -> Result<(), Rejected>;

    /// Submit an empty output buffer to be filled.
    fn fill_this_buffer(&mut self, header: BufferHeader) -> Result<(), Rejected>;
}

/// A native core (one vendor library) able to enumerate and load components.
pub trait NativeBackend: Send + Sync {
    /// Stable backend name, used to key the process-wide init refcount.
    fn name(&self) -> &str;

    /// Whether components come from dedicated hardware.
    fn is_hardware(&self) -> bool {
        true
    }

    fn init(&self) -> Result<(), ErrorCode>;

    fn deinit(&self);

    /// Names of components implementing `role`, in the core's preference order.
    fn components_of_role(&self, role: &str) -> Vec<String>;

    fn get_handle(
        &self,
        component: &str,
        callbacks: Arc<dyn NativeCallbacks>,
    ) -> Result<Box<dyn NativeComponent>, ErrorCode>;

    fn free_handle(&self, component: Box<dyn NativeComponent>) -> Result<(), ErrorCode>;
}
