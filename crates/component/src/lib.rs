#![doc = include_str!("../README.md")]

pub mod chroma;
pub mod convert;
pub mod core;
pub mod csd;
pub mod nal;
pub mod native;
pub mod negotiate;
pub mod port;
pub mod quirks;
pub mod registry;
pub mod roles;
pub mod session;

use native::{Command, ErrorCode};
use nal::RepackError;
use session::SessionState;

/// Encoders and decoders share a session type; the kind selects roles and buffer sizing.
///
/// # Example
/// ```rust
/// use ilkit_component::CodecKind;
///
/// let kind = CodecKind::Decoder;
/// assert_eq!(kind.as_str(), "decoder");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CodecKind {
    /// Turns raw pictures or samples into a compressed stream.
    Encoder,
    /// Turns a compressed stream into raw pictures or samples.
    Decoder,
}

impl CodecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Encoder => "encoder",
            CodecKind::Decoder => "decoder",
        }
    }
}

/// Errors surfaced by component sessions.
///
/// # Example
/// ```rust
/// use ilkit_component::ComponentError;
///
/// let err = ComponentError::NoComponent { role: "video_decoder.avc".into() };
/// assert_eq!(err.code(), "no_component");
/// assert!(err.is_recoverable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// No native component serves the requested role.
    #[error("no component for role {role}")]
    NoComponent { role: String },
    /// A port refused the requested format.
    #[error("port {port} negotiation failed: {reason}")]
    NegotiationFailed { port: u32, reason: String },
    /// A wait exceeded its deadline.
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: String },
    /// A native call failed or the component reported an error event.
    #[error("{operation} failed: {code}")]
    NativeError {
        operation: &'static str,
        code: ErrorCode,
    },
    /// Length-prefixed input was inconsistent; the unit was dropped.
    #[error("malformed input: {0}")]
    MalformedInput(#[from] RepackError),
    /// Buffers could not be allocated.
    #[error("port {port}: buffer allocation failed: {code}")]
    ResourceExhausted { port: u32, code: ErrorCode },
    /// The request itself is invalid.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// The operation is not allowed in the current state.
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl ComponentError {
    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            ComponentError::NoComponent { .. } => "no_component",
            ComponentError::NegotiationFailed { .. } => "negotiation_failed",
            ComponentError::Timeout { .. } => "timeout",
            ComponentError::NativeError { .. } => "native_error",
            ComponentError::MalformedInput(_) => "malformed_input",
            ComponentError::ResourceExhausted { .. } => "resource_exhausted",
            ComponentError::BadParameter(_) => "bad_parameter",
            ComponentError::InvalidState { .. } => "invalid_state",
        }
    }

    /// Stable numeric identifier for C-style consumers.
    pub fn error_code(&self) -> u32 {
        match self {
            ComponentError::NoComponent { .. } => 1,
            ComponentError::NegotiationFailed { .. } => 2,
            ComponentError::Timeout { .. } => 3,
            ComponentError::NativeError { .. } => 4,
            ComponentError::MalformedInput(_) => 5,
            ComponentError::ResourceExhausted { .. } => 6,
            ComponentError::BadParameter(_) => 7,
            ComponentError::InvalidState { .. } => 8,
        }
    }

    /// Whether the caller can carry on: with the next candidate, or with the next unit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ComponentError::NoComponent { .. }
                | ComponentError::NegotiationFailed { .. }
                | ComponentError::MalformedInput(_)
        )
    }

    pub(crate) fn native(operation: &'static str, code: ErrorCode) -> Self {
        ComponentError::NativeError { operation, code }
    }

    pub(crate) fn timeout(command: Command) -> Self {
        ComponentError::Timeout {
            waiting_for: command.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ComponentError>;

pub mod prelude {
    pub use crate::{
        CodecKind, ComponentError, Result,
        convert::{ConvertError, FrameConverter, NativeLayout, PackedCopy},
        core::CoreGuard,
        csd::{CodecConfig, prepare_codec_config},
        nal::{NalRepacker, RepackError},
        native::{
            AudioCoding, AudioPortFormat, AudioPortParams, ColorFormat, Command, ComponentEvent,
            ComponentState, ErrorCode, NativeBackend, NativeCallbacks, NativeComponent,
            PortDefinition, PortDirection, PortFormat, Rejected, SettingsReason, VideoCoding,
            VideoPortFormat,
        },
        negotiate::FormatNegotiator,
        port::Port,
        quirks::{NameMatch, OverrideRule, PortOverride, QuirkFlags, QuirkTable},
        registry::{Candidate, ComponentRegistry},
        roles::role_for,
        session::{
            ComponentSession, OutputUnit, SessionConfig, SessionRequest, SessionState, SessionStats,
        },
    };
}
