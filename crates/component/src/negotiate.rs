//! Translation between pipeline formats and native port definitions.
use std::sync::Arc;

use ilkit_core::prelude::{EsFormat, FormatParams, FourCc};
use tracing::{debug, warn};

use crate::{
    CodecKind, ComponentError, Result,
    chroma::{TI_YUV420_PACKED_SEMI_PLANAR, chroma_of, chroma_sizes, color_format},
    native::{
        AudioPortParams, NativeComponent, PortDefinition, PortDirection, PortFormat, VideoCoding,
    },
    quirks::{OverrideContext, OverrideStage, QuirkFlags, QuirkTable},
    roles::{audio_codec, audio_coding, video_codec, video_coding},
};

/// Negotiates port formats for one loaded component.
///
/// Negotiation reads the native definition, overlays the desired format, applies vendor
/// overrides, writes it back and re-reads it; the native answer is authoritative. Running
/// it again on a settled port yields the same definition.
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    component: String,
    kind: CodecKind,
    codec: FourCc,
    profile_level: Option<(u8, u8)>,
    quirks: Arc<QuirkTable>,
    flags: QuirkFlags,
}

impl FormatNegotiator {
    /// `codec` is the compressed side of the session; `profile_level` feeds H.264 checks.
    pub fn new(
        component: impl Into<String>,
        kind: CodecKind,
        codec: FourCc,
        quirks: Arc<QuirkTable>,
    ) -> Self {
        let component = component.into();
        let flags = quirks.quirks_for(&component, codec, kind);
        Self {
            component,
            kind,
            codec,
            profile_level: None,
            quirks,
            flags,
        }
    }

    pub fn with_profile_level(mut self, profile_level: Option<(u8, u8)>) -> Self {
        self.profile_level = profile_level;
        self
    }

    pub fn flags(&self) -> QuirkFlags {
        self.flags
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn context(&self, direction: PortDirection) -> OverrideContext<'_> {
        OverrideContext {
            component: &self.component,
            kind: self.kind,
            direction,
            codec: self.codec,
            profile_level: self.profile_level,
        }
    }

    fn failed(port: u32, reason: impl Into<String>) -> ComponentError {
        ComponentError::NegotiationFailed {
            port,
            reason: reason.into(),
        }
    }

    /// Settle `port` on `desired`, returning the definition buffers should be sized from.
    pub fn negotiate(
        &self,
        component: &mut dyn NativeComponent,
        port: u32,
        desired: &EsFormat,
    ) -> Result<PortDefinition> {
        let mut def = component
            .port_definition(port)
            .map_err(|code| ComponentError::native("get port definition", code))?;
        let direction = def.direction;
        let frame_size = self.overlay(&mut def, desired)?;

        let ctx = self.context(direction);
        self.quirks
            .apply(OverrideStage::BeforeWrite, &ctx, &mut def)
            .map_err(|e| Self::failed(port, e.to_string()))?;

        component
            .set_port_definition(&def)
            .map_err(|code| Self::failed(port, format!("definition refused: {code}")))?;
        let mut def = component
            .port_definition(port)
            .map_err(|code| ComponentError::native("get port definition", code))?;
        def.buffer_size = def.buffer_size.max(frame_size);

        if let (FormatParams::Audio(audio), PortFormat::Audio(native)) =
            (&desired.params, &def.format)
        {
            let params = AudioPortParams {
                encoding: native.encoding,
                channels: audio.channels,
                rate: audio.rate,
                bitrate: audio.bitrate,
                bits_per_sample: audio.bits_per_sample,
                block_align: audio.block_align,
            };
            match component.set_audio_params(port, &params) {
                Ok(()) => {}
                Err(code) if direction == PortDirection::Input => {
                    return Err(Self::failed(port, format!("audio parameters refused: {code}")));
                }
                Err(code) => {
                    warn!(
                        component = %self.component,
                        port,
                        %code,
                        "output audio parameters refused"
                    );
                }
            }
        }

        self.quirks
            .apply(OverrideStage::AfterRead, &ctx, &mut def)
            .map_err(|e| Self::failed(port, e.to_string()))?;
        debug!(
            component = %self.component,
            port,
            buffer_size = def.buffer_size,
            buffers = def.buffer_count_actual,
            "port negotiated"
        );
        Ok(def)
    }

    // Writes the desired values into `def` and returns the frame size the port must hold.
    fn overlay(&self, def: &mut PortDefinition, desired: &EsFormat) -> Result<u32> {
        let port = def.index;
        let direction = def.direction;
        match (&desired.params, &mut def.format) {
            (FormatParams::Video(v), PortFormat::Video(vf)) => {
                vf.width = v.width;
                vf.height = v.height;
                if vf.compression == VideoCoding::Unused {
                    vf.stride = v.width as i32;
                }
                if let Some(rate) = v.frame_rate
                    && rate.num > 0
                    && rate.den > 0
                {
                    vf.framerate = rate.to_q16();
                }
                if direction == PortDirection::Input || self.kind == CodecKind::Encoder {
                    if direction == PortDirection::Input && self.kind == CodecKind::Encoder {
                        def.buffer_size = v.width.saturating_mul(v.height).saturating_mul(2);
                    }
                    if let Some(coding) = video_coding(desired.codec) {
                        vf.compression = coding;
                        return Ok(def.buffer_size);
                    }
                    let color = color_format(desired.codec).ok_or_else(|| {
                        Self::failed(port, format!("{} matches no native format", desired.codec))
                    })?;
                    vf.color = color;
                    let sizes = chroma_sizes(desired.codec, v.width, v.height)
                        .ok_or_else(|| Self::failed(port, "no chroma layout"))?;
                    vf.stride = sizes.stride as i32;
                    def.buffer_size = sizes.frame_size;
                    Ok(sizes.frame_size)
                } else {
                    if let Some(color) = v.chroma.and_then(color_format) {
                        vf.color = color;
                    }
                    let chroma = chroma_of(vf.color).ok_or_else(|| {
                        Self::failed(port, format!("color format {:?} not supported", vf.color))
                    })?;
                    let sizes = chroma_sizes(chroma, v.width, v.height)
                        .ok_or_else(|| Self::failed(port, "no chroma layout"))?;
                    vf.stride = sizes.stride as i32;
                    def.buffer_size = def.buffer_size.max(sizes.frame_size);
                    Ok(sizes.frame_size)
                }
            }
            (FormatParams::Audio(_), PortFormat::Audio(af)) => {
                if direction == PortDirection::Input {
                    af.encoding = audio_coding(desired.codec).ok_or_else(|| {
                        Self::failed(port, format!("{} matches no native format", desired.codec))
                    })?;
                } else if audio_codec(af.encoding).is_none() {
                    return Err(Self::failed(
                        port,
                        format!("audio encoding {:?} not supported", af.encoding),
                    ));
                }
                Ok(def.buffer_size)
            }
            _ => Err(Self::failed(port, "media kind does not match the port")),
        }
    }

    /// Re-read `port` after a settings change and update `format` to describe it.
    pub fn refresh(
        &self,
        component: &dyn NativeComponent,
        port: u32,
        format: &mut EsFormat,
    ) -> Result<PortDefinition> {
        let mut def = component
            .port_definition(port)
            .map_err(|code| ComponentError::native("get port definition", code))?;
        let direction = def.direction;
        match (&mut format.params, &mut def.format) {
            (FormatParams::Video(v), PortFormat::Video(vf)) => {
                v.width = vf.width;
                v.height = vf.height;
                v.visible = None;
                if let Ok(crop) = component.output_crop(port) {
                    if vf.slice_height == 0 {
                        vf.slice_height = vf.height;
                    }
                    if vf.stride == 0 {
                        vf.stride = vf.width as i32;
                    }
                    v.width = crop.width;
                    v.height = crop.height;
                    v.visible = Some(crop);
                    if vf.color == TI_YUV420_PACKED_SEMI_PLANAR {
                        vf.slice_height = vf.slice_height.saturating_sub(crop.top / 2);
                    }
                }
            }
            (FormatParams::Audio(_), PortFormat::Audio(_)) => {}
            _ => return Err(Self::failed(port, "media kind does not match the port")),
        }

        self.quirks
            .apply(OverrideStage::OnRefresh, &self.context(direction), &mut def)
            .map_err(|e| Self::failed(port, e.to_string()))?;

        match (&mut format.params, &mut def.format) {
            (FormatParams::Video(v), PortFormat::Video(vf)) => {
                if self.flags.contains(QuirkFlags::IGNORE_PADDING) {
                    vf.slice_height = 0;
                    vf.stride = v.width as i32;
                }
                if let Some(codec) = video_codec(vf.compression) {
                    format.codec = codec;
                } else {
                    let chroma = chroma_of(vf.color).ok_or_else(|| {
                        Self::failed(port, format!("color format {:?} not supported", vf.color))
                    })?;
                    format.codec = chroma;
                    v.chroma = Some(chroma);
                    if let Some(sizes) = chroma_sizes(chroma, vf.width, vf.height) {
                        def.buffer_size = def.buffer_size.max(sizes.frame_size);
                    }
                }
            }
            (FormatParams::Audio(a), PortFormat::Audio(af)) => {
                format.codec = audio_codec(af.encoding).ok_or_else(|| {
                    Self::failed(port, format!("audio encoding {:?} not supported", af.encoding))
                })?;
                let params = component
                    .audio_params(port)
                    .map_err(|code| ComponentError::native("get audio parameters", code))?;
                a.channels = params.channels;
                a.rate = params.rate;
                a.bitrate = params.bitrate;
                a.bits_per_sample = params.bits_per_sample;
                a.block_align = params.block_align;
            }
            _ => {}
        }
        debug!(
            component = %self.component,
            port,
            codec = %format.codec,
            buffer_size = def.buffer_size,
            "port definition refreshed"
        );
        Ok(def)
    }
}
