#![doc = include_str!("../README.md")]

pub use ilkit_component as component;
pub use ilkit_core as core;
#[cfg(feature = "virtual")]
pub use ilkit_virtual as virtual_core;

pub use thiserror;

mod clock;
mod session;
pub mod tunables;

use std::sync::Arc;

use ilkit_component::{
    CodecKind, ComponentError,
    core::CoreGuard,
    registry::ComponentRegistry,
    roles::role_for,
    session::{ComponentSession, SessionConfig, SessionRequest},
};
use ilkit_core::prelude::{EsFormat, FormatParams, FourCc, codes};
use tracing::{info, warn};

pub use clock::SampleClock;
pub use session::Session;

/// Errors opening a session.
///
/// # Example
/// ```rust
/// use ilkit::prelude::*;
///
/// let err = OpenRequest::decoder(EsFormat::video(codes::H264, 1280, 720))
///     .open(&ComponentRegistry::new())
///     .unwrap_err();
/// assert_eq!(err.code(), "no_component");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("no component for role {role}")]
    NoComponent { role: String },
    #[error("invalid request: {0}")]
    BadParameter(String),
    #[error("component {component} failed: {source}")]
    Component {
        component: String,
        #[source]
        source: ComponentError,
    },
}

impl OpenError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            OpenError::NoComponent { .. } => "no_component",
            OpenError::BadParameter(_) => "bad_parameter",
            OpenError::Component { source, .. } => source.code(),
        }
    }

    /// Whether opening may succeed when retried.
    pub fn retryable(&self) -> bool {
        match self {
            OpenError::Component { source, .. } => matches!(
                source,
                ComponentError::Timeout { .. } | ComponentError::ResourceExhausted { .. }
            ),
            _ => false,
        }
    }

    /// Failure of the last component tried, if any was.
    pub fn component_error(&self) -> Option<&ComponentError> {
        match self {
            OpenError::Component { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What to open: a decoder for a compressed format or an encoder for a raw one.
///
/// # Example
/// ```rust
/// use ilkit::prelude::*;
///
/// let request = OpenRequest::encoder(EsFormat::video(codes::I420, 640, 480), codes::H264)
///     .bitrate(2_000_000);
/// assert_eq!(request.codec(), codes::H264);
/// ```
#[derive(Debug, Clone)]
pub struct OpenRequest {
    kind: CodecKind,
    input: EsFormat,
    output: EsFormat,
    config: Option<SessionConfig>,
}

impl OpenRequest {
    /// Decode `format`; the component picks the output layout unless
    /// [`OpenRequest::output_chroma`] is set.
    pub fn decoder(format: EsFormat) -> Self {
        let output = match &format.params {
            FormatParams::Video(v) => EsFormat::video(codes::I420, v.width, v.height),
            FormatParams::Audio(a) => {
                let mut pcm = EsFormat::audio(codes::PCM_S16, a.channels, a.rate);
                if let Some(params) = pcm.as_audio_mut() {
                    params.bits_per_sample = 16;
                }
                pcm
            }
        };
        Self {
            kind: CodecKind::Decoder,
            input: format,
            output,
            config: None,
        }
    }

    /// Encode raw `format` into `codec`.
    pub fn encoder(format: EsFormat, codec: FourCc) -> Self {
        let mut output = format.clone();
        output.codec = codec;
        output.extra.clear();
        if let FormatParams::Video(v) = &mut output.params {
            v.chroma = None;
        }
        let mut input = format;
        if let FormatParams::Video(v) = &mut input.params {
            v.chroma = Some(input.codec);
        }
        Self {
            kind: CodecKind::Encoder,
            input,
            output,
            config: None,
        }
    }

    /// Ask a decoder for a specific raw picture format.
    pub fn output_chroma(mut self, chroma: FourCc) -> Self {
        if self.kind == CodecKind::Decoder {
            self.output = self.output.with_chroma(chroma);
            self.output.codec = chroma;
        }
        self
    }

    /// Target bitrate of an encoder, in bits per second.
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        match &mut self.output.params {
            FormatParams::Video(v) => v.bitrate = bitrate,
            FormatParams::Audio(a) => a.bitrate = bitrate,
        }
        self
    }

    /// Use `config` instead of the process-wide tunables.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Codec of the compressed side.
    pub fn codec(&self) -> FourCc {
        match self.kind {
            CodecKind::Decoder => self.input.codec,
            CodecKind::Encoder => self.output.codec,
        }
    }

    pub fn open(self, registry: &ComponentRegistry) -> Result<Session, OpenError> {
        open(registry, self)
    }

    fn validate(&self) -> Result<&'static str, OpenError> {
        if let FormatParams::Video(v) = &self.input.params
            && (v.width == 0 || v.height == 0)
        {
            return Err(OpenError::BadParameter(format!(
                "{} has no geometry",
                self.input.codec
            )));
        }
        role_for(self.codec(), self.input.kind(), self.kind).ok_or_else(|| {
            OpenError::BadParameter(format!(
                "no {} role for {}",
                self.kind.as_str(),
                self.codec()
            ))
        })
    }
}

/// Open the best component for `request`, trying candidates in registry order.
///
/// A candidate that fails to load or negotiate is torn down and the next one is tried;
/// the last failure is returned when none succeeds.
pub fn open(registry: &ComponentRegistry, request: OpenRequest) -> Result<Session, OpenError> {
    let role = request.validate()?;
    let tuned;
    let registry = match tunables::selection_overrides() {
        Some(selection) => {
            tuned = selection.configure(registry);
            &tuned
        }
        None => registry,
    };

    // Cores stay up while their components are enumerated and tried.
    let _cores: Vec<CoreGuard> = registry
        .backends()
        .iter()
        .filter_map(|backend| match CoreGuard::acquire(backend) {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(backend = backend.name(), %err, "native core unavailable");
                None
            }
        })
        .collect();

    let candidates = registry.candidates(role);
    if candidates.is_empty() {
        return Err(OpenError::NoComponent {
            role: role.to_owned(),
        });
    }
    let config = request.config.unwrap_or_else(tunables::session_config);
    let mut last = None;
    for candidate in candidates {
        let session_request = SessionRequest {
            kind: request.kind,
            input: request.input.clone(),
            output: request.output.clone(),
            config,
        };
        let opened = ComponentSession::load(
            Arc::clone(&candidate.backend),
            &candidate.name,
            session_request,
            Arc::clone(registry.quirks()),
        )
        .and_then(|mut session| session.start().map(|()| session));
        match opened {
            Ok(session) => {
                info!(component = %candidate.name, role, "session open");
                return Ok(Session::new(session));
            }
            Err(err) => {
                warn!(
                    component = %candidate.name,
                    role,
                    code = err.code(),
                    %err,
                    "candidate failed"
                );
                last = Some(OpenError::Component {
                    component: candidate.name,
                    source: err,
                });
            }
        }
    }
    Err(last.unwrap_or(OpenError::NoComponent {
        role: role.to_owned(),
    }))
}

pub mod prelude {
    pub use crate::{
        OpenError, OpenRequest, SampleClock, Session, open,
        tunables::{
            IlkitConfig, SelectionTunables, SessionTunables, set_selection_tunables,
            set_session_tunables,
        },
    };
    pub use ilkit_component::prelude::*;
    pub use ilkit_core::prelude::*;
}
