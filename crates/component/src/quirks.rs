//! Vendor workarounds expressed as data.
//!
//! Component names are matched against a static table; each hit contributes either a
//! [`QuirkFlags`] bit or a [`PortOverride`] applied at a fixed [`OverrideStage`] of
//! negotiation.
use std::borrow::Cow;

use bitflags::bitflags;
use ilkit_core::prelude::{FourCc, codes};
use tracing::debug;

use crate::{
    CodecKind,
    chroma::{align16, chroma_of, chroma_sizes},
    native::{ColorFormat, PortDefinition, PortDirection, PortFormat},
};

/// How a rule's pattern is compared with a component name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NameMatch {
    Exact(Cow<'static, str>),
    Prefix(Cow<'static, str>),
    Suffix(Cow<'static, str>),
}

impl NameMatch {
    pub const fn exact(name: &'static str) -> Self {
        NameMatch::Exact(Cow::Borrowed(name))
    }

    pub const fn prefix(name: &'static str) -> Self {
        NameMatch::Prefix(Cow::Borrowed(name))
    }

    pub const fn suffix(name: &'static str) -> Self {
        NameMatch::Suffix(Cow::Borrowed(name))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Exact(p) => name == p.as_ref(),
            NameMatch::Prefix(p) => name.starts_with(p.as_ref()),
            NameMatch::Suffix(p) => name.ends_with(p.as_ref()),
        }
    }
}

bitflags! {
    /// Behavioral switches attached to a component for its whole life.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct QuirkFlags: u32 {
        /// Refuses to start without codec configuration data.
        const NEED_CSD            = 1 << 0;
        /// Needs the channel count written even for compressed audio.
        const AUDIO_NEED_CHANNELS = 1 << 1;
        /// Reports padding it does not actually apply to output frames.
        const IGNORE_PADDING      = 1 << 2;
        /// Can emit interlaced pictures.
        const SUPPORT_INTERLACED  = 1 << 3;
    }
}

/// Point in negotiation where an override runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideStage {
    /// On the overlaid definition, before it is written to the component.
    BeforeWrite,
    /// On the local copy after the authoritative re-read.
    AfterRead,
    /// Whenever an output definition is refreshed after a settings change.
    OnRefresh,
}

/// One vendor workaround.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortOverride {
    /// H.264 is refused unless Baseline (when `baseline_only`) and at most `max_level`.
    RejectH264Unless { baseline_only: bool, max_level: u8 },
    /// Replace `from` with `to` and recompute the frame sizes.
    ForceColorFormat { from: ColorFormat, to: ColorFormat },
    /// The component wants frames per second, not Q16.
    FramerateNotQ16,
    ClampBufferSize { max: u32 },
    ClearStrideAndSliceHeight,
    ScaleBufferSize { factor: u32 },
    /// The component reports `reported` but delivers `actual`.
    ReportedColorFormat {
        reported: ColorFormat,
        actual: ColorFormat,
    },
}

impl PortOverride {
    pub fn stage(&self) -> OverrideStage {
        match self {
            PortOverride::RejectH264Unless { .. }
            | PortOverride::ForceColorFormat { .. }
            | PortOverride::FramerateNotQ16
            | PortOverride::ClampBufferSize { .. }
            | PortOverride::ClearStrideAndSliceHeight => OverrideStage::BeforeWrite,
            PortOverride::ScaleBufferSize { .. } => OverrideStage::AfterRead,
            PortOverride::ReportedColorFormat { .. } => OverrideStage::OnRefresh,
        }
    }
}

/// Override scoped to a component, codec kind and optionally one port direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    pub component: NameMatch,
    pub kind: Option<CodecKind>,
    pub direction: Option<PortDirection>,
    pub action: PortOverride,
}

/// Facts about the port being negotiated that overrides may consult.
#[derive(Debug, Clone, Copy)]
pub struct OverrideContext<'a> {
    pub component: &'a str,
    pub kind: CodecKind,
    pub direction: PortDirection,
    pub codec: FourCc,
    /// `(profile_idc, level_idc)` of an H.264 stream, when known.
    pub profile_level: Option<(u8, u8)>,
}

/// Why an override refused a definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{component}: {reason}")]
pub struct OverrideRejected {
    pub component: String,
    pub reason: String,
}

const H264_PROFILE_BASELINE: u8 = 66;

const fn rule(
    component: NameMatch,
    kind: Option<CodecKind>,
    direction: Option<PortDirection>,
    action: PortOverride,
) -> OverrideRule {
    OverrideRule {
        component,
        kind,
        direction,
        action,
    }
}

/// Workarounds, quirk flags and blacklist consulted while loading components.
///
/// # Example
/// ```rust
/// use ilkit_component::quirks::{QuirkFlags, QuirkTable};
/// use ilkit_component::CodecKind;
/// use ilkit_core::prelude::codes;
///
/// let table = QuirkTable::builtin();
/// assert!(table.is_blacklisted("OMX.google.h264.decoder"));
/// let flags = table.quirks_for("OMX.SEC.avc.dec", codes::H264, CodecKind::Decoder);
/// assert!(flags.contains(QuirkFlags::IGNORE_PADDING | QuirkFlags::NEED_CSD));
/// ```
#[derive(Debug, Clone, Default)]
pub struct QuirkTable {
    overrides: Vec<OverrideRule>,
    quirks: Vec<(NameMatch, QuirkFlags)>,
    codec_quirks: Vec<(FourCc, QuirkFlags)>,
    blacklist: Vec<NameMatch>,
}

impl QuirkTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table of known vendor workarounds.
    pub fn builtin() -> Self {
        let decoder = Some(CodecKind::Decoder);
        let encoder = Some(CodecKind::Encoder);
        let input = Some(PortDirection::Input);
        let output = Some(PortDirection::Output);
        Self {
            overrides: vec![
                rule(
                    NameMatch::exact("OMX.TI.Video.Decoder"),
                    decoder,
                    input,
                    PortOverride::RejectH264Unless {
                        baseline_only: true,
                        max_level: 30,
                    },
                ),
                rule(
                    NameMatch::exact("OMX.TI.Video.Decoder"),
                    decoder,
                    output,
                    PortOverride::ForceColorFormat {
                        from: ColorFormat::Yuv420Planar,
                        to: ColorFormat::CbYCrY,
                    },
                ),
                rule(
                    NameMatch::prefix("OMX.st.video_encoder"),
                    encoder,
                    None,
                    PortOverride::FramerateNotQ16,
                ),
                rule(
                    NameMatch::prefix("OMX.qcom.video.decoder"),
                    decoder,
                    input,
                    PortOverride::ClampBufferSize { max: 450 * 1024 },
                ),
                rule(
                    NameMatch::prefix("OMX.qcom.video.decoder"),
                    decoder,
                    output,
                    PortOverride::ReportedColorFormat {
                        reported: ColorFormat::Yuv420Planar,
                        actual: ColorFormat::Yvu420SemiPlanar,
                    },
                ),
                rule(
                    NameMatch::prefix("OMX.broadcom.video_decode"),
                    decoder,
                    None,
                    PortOverride::ClearStrideAndSliceHeight,
                ),
                rule(
                    NameMatch::exact("OMX.TI.DUCATI1.VIDEO.DECODER"),
                    decoder,
                    output,
                    PortOverride::ScaleBufferSize { factor: 2 },
                ),
            ],
            quirks: vec![
                (
                    NameMatch::prefix("OMX.MTK.VIDEO.DECODER.MPEG4"),
                    QuirkFlags::NEED_CSD,
                ),
                (
                    NameMatch::prefix("OMX.Marvell"),
                    QuirkFlags::AUDIO_NEED_CHANNELS,
                ),
                (
                    NameMatch::prefix("OMX.SEC.avc.dec"),
                    QuirkFlags::IGNORE_PADDING,
                ),
                (
                    NameMatch::prefix("OMX.SEC.avcdec"),
                    QuirkFlags::IGNORE_PADDING,
                ),
                (
                    NameMatch::prefix("OMX.SEC.MPEG4.Decoder"),
                    QuirkFlags::IGNORE_PADDING,
                ),
                (
                    NameMatch::prefix("OMX.SEC.mpeg4.dec"),
                    QuirkFlags::IGNORE_PADDING,
                ),
                (
                    NameMatch::prefix("OMX.SEC.vc1.dec"),
                    QuirkFlags::IGNORE_PADDING,
                ),
                (
                    NameMatch::prefix("OMX.amlogic.avc.decoder.awesome"),
                    QuirkFlags::SUPPORT_INTERLACED,
                ),
            ],
            codec_quirks: vec![
                (codes::H264, QuirkFlags::NEED_CSD),
                (codes::VC1, QuirkFlags::NEED_CSD),
                (codes::VORBIS, QuirkFlags::NEED_CSD),
                (codes::AAC, QuirkFlags::NEED_CSD),
            ],
            blacklist: vec![
                NameMatch::prefix("OMX.PV."),
                NameMatch::prefix("OMX.google."),
                NameMatch::prefix("OMX.ARICENT."),
                NameMatch::prefix("OMX.SEC.WMV.Decoder"),
                NameMatch::prefix("OMX.SEC.MP3.Decoder"),
                NameMatch::prefix("OMX.MTK.VIDEO.DECODER.VC1"),
                NameMatch::prefix("OMX.SEC.vp8.dec"),
                NameMatch::suffix(".secure"),
                NameMatch::suffix(".sw.dec"),
            ],
        }
    }

    pub fn with_override(mut self, rule: OverrideRule) -> Self {
        self.overrides.push(rule);
        self
    }

    pub fn with_quirk(mut self, component: NameMatch, flags: QuirkFlags) -> Self {
        self.quirks.push((component, flags));
        self
    }

    pub fn with_blacklisted(mut self, component: NameMatch) -> Self {
        self.blacklist.push(component);
        self
    }

    /// Whether `component` must never be loaded.
    pub fn is_blacklisted(&self, component: &str) -> bool {
        self.blacklist.iter().any(|m| m.matches(component))
    }

    /// Flags for `component` serving `codec`.
    ///
    /// Codec-keyed flags apply to decoders only; encoders generate their own configuration.
    pub fn quirks_for(&self, component: &str, codec: FourCc, kind: CodecKind) -> QuirkFlags {
        let by_name = self
            .quirks
            .iter()
            .filter(|(m, _)| m.matches(component))
            .fold(QuirkFlags::empty(), |acc, (_, f)| acc | *f);
        let by_codec = match kind {
            CodecKind::Decoder => self
                .codec_quirks
                .iter()
                .filter(|(c, _)| *c == codec)
                .fold(QuirkFlags::empty(), |acc, (_, f)| acc | *f),
            CodecKind::Encoder => QuirkFlags::empty(),
        };
        by_name | by_codec
    }

    /// Overrides matching the context, in table order.
    pub fn overrides_for<'a>(
        &'a self,
        ctx: &'a OverrideContext<'_>,
    ) -> impl Iterator<Item = &'a PortOverride> + 'a {
        self.overrides
            .iter()
            .filter(move |r| {
                r.component.matches(ctx.component)
                    && r.kind.is_none_or(|k| k == ctx.kind)
                    && r.direction.is_none_or(|d| d == ctx.direction)
            })
            .map(|r| &r.action)
    }

    /// Apply every override of `stage` matching `ctx` to `def`.
    pub fn apply(
        &self,
        stage: OverrideStage,
        ctx: &OverrideContext<'_>,
        def: &mut PortDefinition,
    ) -> Result<(), OverrideRejected> {
        for action in self.overrides_for(ctx).filter(|a| a.stage() == stage) {
            debug!(
                component = ctx.component,
                port = def.index,
                ?action,
                "applying port override"
            );
            apply_one(*action, ctx, def)?;
        }
        Ok(())
    }
}

fn apply_one(
    action: PortOverride,
    ctx: &OverrideContext<'_>,
    def: &mut PortDefinition,
) -> Result<(), OverrideRejected> {
    let reject = |reason: String| OverrideRejected {
        component: ctx.component.to_owned(),
        reason,
    };
    match action {
        PortOverride::RejectH264Unless {
            baseline_only,
            max_level,
        } => {
            if ctx.codec != codes::H264 {
                return Ok(());
            }
            if let Some((profile, level)) = ctx.profile_level {
                if baseline_only && profile != H264_PROFILE_BASELINE {
                    return Err(reject(format!("h264 profile {profile} is not baseline")));
                }
                if level > max_level {
                    return Err(reject(format!("h264 level {level} above {max_level}")));
                }
            }
        }
        PortOverride::ForceColorFormat { from, to } => {
            let PortDefinition {
                format: PortFormat::Video(video),
                buffer_size,
                ..
            } = def
            else {
                return Ok(());
            };
            if video.color != from {
                return Ok(());
            }
            video.color = to;
            if let Some(sizes) =
                chroma_of(to).and_then(|c| chroma_sizes(c, video.width, video.height))
            {
                video.stride = sizes.stride as i32;
                video.slice_height = align16(video.height);
                *buffer_size = sizes.frame_size;
            }
        }
        PortOverride::FramerateNotQ16 => {
            if let Some(video) = def.video_mut() {
                video.framerate >>= 16;
            }
        }
        PortOverride::ClampBufferSize { max } => {
            def.buffer_size = def.buffer_size.min(max);
        }
        PortOverride::ClearStrideAndSliceHeight => {
            if let Some(video) = def.video_mut() {
                video.stride = 0;
                video.slice_height = 0;
            }
        }
        PortOverride::ScaleBufferSize { factor } => {
            def.buffer_size = def.buffer_size.saturating_mul(factor);
        }
        PortOverride::ReportedColorFormat { reported, actual } => {
            if let Some(video) = def.video_mut()
                && video.color == reported
            {
                video.color = actual;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{VideoCoding, VideoPortFormat};

    fn video_def(direction: PortDirection, color: ColorFormat) -> PortDefinition {
        PortDefinition {
            index: 1,
            direction,
            enabled: true,
            populated: false,
            buffer_count_actual: 4,
            buffer_count_min: 2,
            buffer_size: 1_000_000,
            format: PortFormat::Video(VideoPortFormat {
                compression: VideoCoding::Unused,
                color,
                width: 176,
                height: 144,
                stride: 176,
                slice_height: 144,
                framerate: 25 << 16,
                bitrate: 0,
            }),
        }
    }

    fn ctx<'a>(
        component: &'a str,
        kind: CodecKind,
        direction: PortDirection,
        codec: FourCc,
    ) -> OverrideContext<'a> {
        OverrideContext {
            component,
            kind,
            direction,
            codec,
            profile_level: None,
        }
    }

    #[test]
    fn name_matching_modes() {
        assert!(NameMatch::exact("a.b").matches("a.b"));
        assert!(!NameMatch::exact("a.b").matches("a.bc"));
        assert!(NameMatch::prefix("OMX.qcom").matches("OMX.qcom.video.decoder.avc"));
        assert!(NameMatch::suffix(".secure").matches("OMX.qcom.video.decoder.avc.secure"));
    }

    #[test]
    fn blacklist_covers_prefixes_and_suffixes() {
        let table = QuirkTable::builtin();
        assert!(table.is_blacklisted("OMX.PV.mpeg4dec"));
        assert!(table.is_blacklisted("OMX.foo.avc.sw.dec"));
        assert!(!table.is_blacklisted("OMX.qcom.video.decoder.avc"));
    }

    #[test]
    fn codec_quirks_apply_to_decoders_only() {
        let table = QuirkTable::builtin();
        let dec = table.quirks_for("OMX.any", codes::H264, CodecKind::Decoder);
        let enc = table.quirks_for("OMX.any", codes::H264, CodecKind::Encoder);
        assert!(dec.contains(QuirkFlags::NEED_CSD));
        assert!(enc.is_empty());
        let mtk = table.quirks_for("OMX.MTK.VIDEO.DECODER.MPEG4", codes::MPEG4, CodecKind::Decoder);
        assert_eq!(mtk, QuirkFlags::NEED_CSD);
    }

    #[test]
    fn ti_rejects_high_profile() {
        let table = QuirkTable::builtin();
        let mut def = video_def(PortDirection::Input, ColorFormat::Unused);
        let mut c = ctx(
            "OMX.TI.Video.Decoder",
            CodecKind::Decoder,
            PortDirection::Input,
            codes::H264,
        );
        c.profile_level = Some((100, 31));
        assert!(table.apply(OverrideStage::BeforeWrite, &c, &mut def).is_err());
        c.profile_level = Some((66, 30));
        assert!(table.apply(OverrideStage::BeforeWrite, &c, &mut def).is_ok());

        // Only the exact component name carries the restriction.
        let mut sibling = ctx(
            "OMX.TI.Video.Decoder.foo",
            CodecKind::Decoder,
            PortDirection::Input,
            codes::H264,
        );
        sibling.profile_level = Some((100, 31));
        assert!(table.apply(OverrideStage::BeforeWrite, &sibling, &mut def).is_ok());
    }

    #[test]
    fn ti_output_forced_to_packed_422() {
        let table = QuirkTable::builtin();
        let mut def = video_def(PortDirection::Output, ColorFormat::Yuv420Planar);
        let c = ctx(
            "OMX.TI.Video.Decoder",
            CodecKind::Decoder,
            PortDirection::Output,
            codes::H264,
        );
        table.apply(OverrideStage::BeforeWrite, &c, &mut def).unwrap();
        let video = def.video().unwrap();
        assert_eq!(video.color, ColorFormat::CbYCrY);
        assert_eq!(video.stride, 176 * 2);
        assert_eq!(def.buffer_size, 176 * 144 * 2);
    }

    #[test]
    fn overrides_respect_stage_and_direction() {
        let table = QuirkTable::builtin();
        let c = ctx(
            "OMX.qcom.video.decoder.avc",
            CodecKind::Decoder,
            PortDirection::Input,
            codes::H264,
        );
        let mut def = video_def(PortDirection::Input, ColorFormat::Unused);
        table.apply(OverrideStage::AfterRead, &c, &mut def).unwrap();
        assert_eq!(def.buffer_size, 1_000_000);
        table.apply(OverrideStage::BeforeWrite, &c, &mut def).unwrap();
        assert_eq!(def.buffer_size, 450 * 1024);

        let out = ctx(
            "OMX.qcom.video.decoder.avc",
            CodecKind::Decoder,
            PortDirection::Output,
            codes::H264,
        );
        let mut def = video_def(PortDirection::Output, ColorFormat::Yuv420Planar);
        table.apply(OverrideStage::BeforeWrite, &out, &mut def).unwrap();
        assert_eq!(def.buffer_size, 1_000_000);
        table.apply(OverrideStage::OnRefresh, &out, &mut def).unwrap();
        assert_eq!(def.video().unwrap().color, ColorFormat::Yvu420SemiPlanar);
    }

    #[test]
    fn st_encoder_framerate_is_integral() {
        let table = QuirkTable::builtin();
        let c = ctx(
            "OMX.st.video_encoder.avc",
            CodecKind::Encoder,
            PortDirection::Input,
            codes::H264,
        );
        let mut def = video_def(PortDirection::Input, ColorFormat::Yuv420Planar);
        table.apply(OverrideStage::BeforeWrite, &c, &mut def).unwrap();
        assert_eq!(def.video().unwrap().framerate, 25);
    }
}
