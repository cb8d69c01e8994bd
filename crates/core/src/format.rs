use std::{fmt, str::FromStr};

/// Four-character code describing a codec or raw sample format.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"h264");
/// assert_eq!(fcc.to_string(), "h264");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Raw bytes.
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Well-known codes used by the pipeline.
pub mod codes {
    use super::FourCc;

    pub const H264: FourCc = FourCc::new(*b"h264");
    pub const HEVC: FourCc = FourCc::new(*b"hevc");
    pub const MPEG2: FourCc = FourCc::new(*b"mpgv");
    pub const MPEG4: FourCc = FourCc::new(*b"mp4v");
    pub const H263: FourCc = FourCc::new(*b"h263");
    pub const WMV1: FourCc = FourCc::new(*b"WMV1");
    pub const WMV2: FourCc = FourCc::new(*b"WMV2");
    pub const WMV3: FourCc = FourCc::new(*b"WMV3");
    pub const VC1: FourCc = FourCc::new(*b"VC-1");
    pub const MJPEG: FourCc = FourCc::new(*b"MJPG");
    pub const JPEG: FourCc = FourCc::new(*b"jpeg");
    pub const RV30: FourCc = FourCc::new(*b"RV30");
    pub const RV40: FourCc = FourCc::new(*b"RV40");
    pub const VP8: FourCc = FourCc::new(*b"VP80");
    pub const VP9: FourCc = FourCc::new(*b"VP90");

    pub const AMR_NB: FourCc = FourCc::new(*b"samr");
    pub const AMR_WB: FourCc = FourCc::new(*b"sawb");
    pub const AAC: FourCc = FourCc::new(*b"mp4a");
    pub const MP3: FourCc = FourCc::new(*b"mpga");
    pub const VORBIS: FourCc = FourCc::new(*b"vorb");
    pub const PCM_S16: FourCc = FourCc::new(*b"s16l");

    pub const I420: FourCc = FourCc::new(*b"I420");
    pub const NV12: FourCc = FourCc::new(*b"NV12");
    pub const NV21: FourCc = FourCc::new(*b"NV21");
    pub const YUYV: FourCc = FourCc::new(*b"YUY2");
    pub const YVYU: FourCc = FourCc::new(*b"YVYU");
    pub const UYVY: FourCc = FourCc::new(*b"UYVY");
    pub const VYUY: FourCc = FourCc::new(*b"VYUY");
}

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MediaKind {
    Video,
    Audio,
}

/// Frame rate as a rational.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::FrameRate;
///
/// let rate = FrameRate::new(30_000, 1_001);
/// assert_eq!(rate.to_q16() >> 16, 29);
/// assert_eq!(FrameRate::from_q16(25 << 16), FrameRate::new(25, 1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Frames per second in Q16 fixed point; zero when the denominator is zero.
    pub fn to_q16(self) -> u32 {
        if self.den == 0 {
            return 0;
        }
        ((u64::from(self.num) << 16) / u64::from(self.den)).min(u64::from(u32::MAX)) as u32
    }

    /// Inverse of [`FrameRate::to_q16`], reduced to an integer rate when exact.
    pub fn from_q16(q16: u32) -> Self {
        if q16 & 0xffff == 0 {
            Self::new(q16 >> 16, 1)
        } else {
            Self::new(q16, 1 << 16)
        }
    }
}

/// Visible window inside a decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Video parameters of an elementary stream or raw picture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoParams {
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// Visible window, when smaller than the coded size.
    pub visible: Option<Crop>,
    /// Nominal frame rate.
    pub frame_rate: Option<FrameRate>,
    /// Raw picture format for the uncompressed side; `None` for compressed streams.
    pub chroma: Option<FourCc>,
    /// Target bitrate in bits per second, used by encoders.
    pub bitrate: u32,
}

/// Audio parameters of an elementary stream or raw sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AudioParams {
    pub channels: u16,
    pub rate: u32,
    pub bits_per_sample: u16,
    pub block_align: u32,
    pub bitrate: u32,
}

/// Kind-specific part of an [`EsFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatParams {
    Video(VideoParams),
    Audio(AudioParams),
}

/// Generic media format as seen by the pipeline.
///
/// # Example
/// ```rust
/// use ilkit_core::prelude::{EsFormat, MediaKind, codes};
///
/// let fmt = EsFormat::video(codes::H264, 1280, 720).with_extra(vec![1, 2, 3]);
/// assert_eq!(fmt.kind(), MediaKind::Video);
/// assert_eq!(fmt.as_video().map(|v| v.width), Some(1280));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EsFormat {
    /// Codec or raw sample format.
    pub codec: FourCc,
    /// Kind-specific parameters.
    pub params: FormatParams,
    /// Codec configuration bytes (avcC, hvcC, sequence headers, ...).
    #[cfg_attr(feature = "serde", serde(default))]
    pub extra: Vec<u8>,
}

impl EsFormat {
    /// Video format with the given coded size.
    pub fn video(codec: FourCc, width: u32, height: u32) -> Self {
        Self {
            codec,
            params: FormatParams::Video(VideoParams {
                width,
                height,
                ..VideoParams::default()
            }),
            extra: Vec::new(),
        }
    }

    /// Audio format with the given channel count and sample rate.
    pub fn audio(codec: FourCc, channels: u16, rate: u32) -> Self {
        Self {
            codec,
            params: FormatParams::Audio(AudioParams {
                channels,
                rate,
                ..AudioParams::default()
            }),
            extra: Vec::new(),
        }
    }

    /// Attach codec configuration bytes.
    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }

    /// Set the frame rate of a video format; no-op for audio.
    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        if let FormatParams::Video(v) = &mut self.params {
            v.frame_rate = Some(rate);
        }
        self
    }

    /// Set the raw picture format of a video format; no-op for audio.
    pub fn with_chroma(mut self, chroma: FourCc) -> Self {
        if let FormatParams::Video(v) = &mut self.params {
            v.chroma = Some(chroma);
        }
        self
    }

    /// Audio or video.
    pub fn kind(&self) -> MediaKind {
        match self.params {
            FormatParams::Video(_) => MediaKind::Video,
            FormatParams::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn as_video(&self) -> Option<&VideoParams> {
        match &self.params {
            FormatParams::Video(v) => Some(v),
            FormatParams::Audio(_) => None,
        }
    }

    pub fn as_video_mut(&mut self) -> Option<&mut VideoParams> {
        match &mut self.params {
            FormatParams::Video(v) => Some(v),
            FormatParams::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioParams> {
        match &self.params {
            FormatParams::Audio(a) => Some(a),
            FormatParams::Video(_) => None,
        }
    }

    pub fn as_audio_mut(&mut self) -> Option<&mut AudioParams> {
        match &mut self.params {
            FormatParams::Audio(a) => Some(a),
            FormatParams::Video(_) => None,
        }
    }
}
