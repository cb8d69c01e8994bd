//! Mapping between pipeline codec codes, native codings and standard component roles.
use ilkit_core::prelude::{FourCc, MediaKind, codes};

use crate::{
    CodecKind,
    native::{AudioCoding, VideoCoding},
};

/// One row of a video role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoRole {
    pub codec: FourCc,
    pub coding: VideoCoding,
    pub role: &'static str,
}

/// One row of an audio role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRole {
    pub codec: FourCc,
    pub coding: AudioCoding,
    pub role: &'static str,
}

const fn video(codec: FourCc, coding: VideoCoding, role: &'static str) -> VideoRole {
    VideoRole {
        codec,
        coding,
        role,
    }
}

const fn audio(codec: FourCc, coding: AudioCoding, role: &'static str) -> AudioRole {
    AudioRole {
        codec,
        coding,
        role,
    }
}

pub static VIDEO_DECODERS: &[VideoRole] = &[
    video(codes::MPEG2, VideoCoding::Mpeg2, "video_decoder.mpeg2"),
    video(codes::MPEG4, VideoCoding::Mpeg4, "video_decoder.mpeg4"),
    video(codes::HEVC, VideoCoding::Hevc, "video_decoder.hevc"),
    video(codes::H264, VideoCoding::Avc, "video_decoder.avc"),
    video(codes::H263, VideoCoding::H263, "video_decoder.h263"),
    video(codes::WMV1, VideoCoding::Wmv, "video_decoder.wmv1"),
    video(codes::WMV2, VideoCoding::Wmv, "video_decoder.wmv2"),
    video(codes::WMV3, VideoCoding::Wmv, "video_decoder.wmv"),
    video(codes::VC1, VideoCoding::Wmv, "video_decoder.wmv"),
    video(codes::MJPEG, VideoCoding::Mjpeg, "video_decoder.jpeg"),
    video(codes::JPEG, VideoCoding::Mjpeg, "video_decoder.jpeg"),
    video(codes::RV30, VideoCoding::Rv, "video_decoder.rv"),
    video(codes::RV40, VideoCoding::Rv, "video_decoder.rv"),
    video(codes::VP8, VideoCoding::Vp8, "video_decoder.vp8"),
    video(codes::VP9, VideoCoding::Vp9, "video_decoder.vp9"),
];

pub static VIDEO_ENCODERS: &[VideoRole] = &[
    video(codes::MPEG2, VideoCoding::Mpeg2, "video_encoder.mpeg2"),
    video(codes::MPEG4, VideoCoding::Mpeg4, "video_encoder.mpeg4"),
    video(codes::H264, VideoCoding::Avc, "video_encoder.avc"),
    video(codes::H263, VideoCoding::H263, "video_encoder.h263"),
    video(codes::WMV1, VideoCoding::Wmv, "video_encoder.wmv"),
    video(codes::WMV2, VideoCoding::Wmv, "video_encoder.wmv"),
    video(codes::WMV3, VideoCoding::Wmv, "video_encoder.wmv"),
    video(codes::MJPEG, VideoCoding::Mjpeg, "video_encoder.jpeg"),
    video(codes::RV30, VideoCoding::Rv, "video_encoder.rv"),
    video(codes::RV40, VideoCoding::Rv, "video_encoder.rv"),
];

pub static AUDIO_DECODERS: &[AudioRole] = &[
    audio(codes::AMR_NB, AudioCoding::Amr, "audio_decoder.amrnb"),
    audio(codes::AMR_WB, AudioCoding::Amr, "audio_decoder.amrwb"),
    audio(codes::AAC, AudioCoding::Aac, "audio_decoder.aac"),
    audio(codes::PCM_S16, AudioCoding::Pcm, "audio_decoder.pcm"),
    audio(codes::MP3, AudioCoding::Mp3, "audio_decoder.mp3"),
    audio(codes::VORBIS, AudioCoding::Vorbis, "audio_decoder.vorbis"),
];

pub static AUDIO_ENCODERS: &[AudioRole] = &[
    audio(codes::AMR_NB, AudioCoding::Amr, "audio_encoder.amrnb"),
    audio(codes::AMR_WB, AudioCoding::Amr, "audio_encoder.amrwb"),
    audio(codes::AAC, AudioCoding::Aac, "audio_encoder.aac"),
    audio(codes::PCM_S16, AudioCoding::Pcm, "audio_encoder.pcm"),
];

/// Standard role name serving `codec`.
///
/// # Example
/// ```rust
/// use ilkit_component::{CodecKind, roles::role_for};
/// use ilkit_core::prelude::{MediaKind, codes};
///
/// assert_eq!(
///     role_for(codes::H264, MediaKind::Video, CodecKind::Decoder),
///     Some("video_decoder.avc")
/// );
/// assert_eq!(role_for(codes::VP9, MediaKind::Video, CodecKind::Encoder), None);
/// ```
pub fn role_for(codec: FourCc, kind: MediaKind, codec_kind: CodecKind) -> Option<&'static str> {
    match (kind, codec_kind) {
        (MediaKind::Video, CodecKind::Decoder) => find_video(VIDEO_DECODERS, codec).map(|r| r.role),
        (MediaKind::Video, CodecKind::Encoder) => find_video(VIDEO_ENCODERS, codec).map(|r| r.role),
        (MediaKind::Audio, CodecKind::Decoder) => find_audio(AUDIO_DECODERS, codec).map(|r| r.role),
        (MediaKind::Audio, CodecKind::Encoder) => find_audio(AUDIO_ENCODERS, codec).map(|r| r.role),
    }
}

/// Native coding of a compressed video codec.
pub fn video_coding(codec: FourCc) -> Option<VideoCoding> {
    find_video(VIDEO_DECODERS, codec)
        .or_else(|| find_video(VIDEO_ENCODERS, codec))
        .map(|r| r.coding)
}

/// Pipeline codec for a native video coding; the first table row wins.
pub fn video_codec(coding: VideoCoding) -> Option<FourCc> {
    VIDEO_DECODERS
        .iter()
        .find(|r| r.coding == coding)
        .map(|r| r.codec)
}

/// Native encoding of an audio codec.
pub fn audio_coding(codec: FourCc) -> Option<AudioCoding> {
    find_audio(AUDIO_DECODERS, codec)
        .or_else(|| find_audio(AUDIO_ENCODERS, codec))
        .map(|r| r.coding)
}

/// Pipeline codec for a native audio encoding.
pub fn audio_codec(coding: AudioCoding) -> Option<FourCc> {
    AUDIO_DECODERS
        .iter()
        .find(|r| r.coding == coding)
        .map(|r| r.codec)
}

fn find_video(table: &'static [VideoRole], codec: FourCc) -> Option<&'static VideoRole> {
    table.iter().find(|r| r.codec == codec)
}

fn find_audio(table: &'static [AudioRole], codec: FourCc) -> Option<&'static AudioRole> {
    table.iter().find(|r| r.codec == codec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vc1_and_wmv3_share_the_wmv_role() {
        let wmv3 = role_for(codes::WMV3, MediaKind::Video, CodecKind::Decoder);
        let vc1 = role_for(codes::VC1, MediaKind::Video, CodecKind::Decoder);
        assert_eq!(wmv3, Some("video_decoder.wmv"));
        assert_eq!(wmv3, vc1);
    }

    #[test]
    fn codings_map_back_to_codecs() {
        assert_eq!(video_coding(codes::H264), Some(VideoCoding::Avc));
        assert_eq!(video_codec(VideoCoding::Avc), Some(codes::H264));
        assert_eq!(audio_codec(AudioCoding::Pcm), Some(codes::PCM_S16));
        assert_eq!(audio_coding(codes::MP3), Some(AudioCoding::Mp3));
        assert_eq!(video_coding(codes::I420), None);
    }

    #[test]
    fn audio_roles_follow_direction() {
        assert_eq!(
            role_for(codes::AAC, MediaKind::Audio, CodecKind::Encoder),
            Some("audio_encoder.aac")
        );
        assert_eq!(role_for(codes::MP3, MediaKind::Audio, CodecKind::Encoder), None);
    }
}
