//! Codec configuration data: container extradata to the form components expect.
use ilkit_core::prelude::{EsFormat, codes};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Annex B configuration converted from an `avcC`/`hvcC` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnexB {
    /// Parameter sets, each behind a 4-byte start code.
    pub data: Vec<u8>,
    /// Width of the length prefixes used by the sample data.
    pub nal_length_size: u8,
}

/// Configuration bytes ready for submission ahead of media data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub data: Vec<u8>,
    /// Set when sample data is length-prefixed and must be repacked.
    pub nal_length_size: Option<u8>,
}

/// Whether `data` starts with a 3- or 4-byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&START_CODE)
}

/// Whether `data` looks like an `avcC` record.
pub fn is_avcc(data: &[u8]) -> bool {
    data.len() >= 7 && data[0] == 1
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    // Appends `count` entries of `[u16 len][nal]` to `out`.
    fn nal_entries(&mut self, count: usize, out: &mut Vec<u8>) -> Option<()> {
        for _ in 0..count {
            let len = usize::from(self.u16()?);
            let nal = self.bytes(len)?;
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        Some(())
    }
}

/// Convert an `avcC` record into Annex B SPS/PPS.
///
/// Returns `None` when the record is truncated or not version 1.
///
/// # Example
/// ```rust
/// use ilkit_component::csd::avcc_to_annexb;
///
/// let avcc = [1, 0x42, 0, 0x1e, 0xff, 0xe1, 0, 2, 0x67, 0x42, 1, 0, 1, 0x68];
/// let annexb = avcc_to_annexb(&avcc).unwrap();
/// assert_eq!(annexb.nal_length_size, 4);
/// assert_eq!(annexb.data, [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68]);
/// ```
pub fn avcc_to_annexb(avcc: &[u8]) -> Option<AnnexB> {
    if !is_avcc(avcc) {
        return None;
    }
    let nal_length_size = (avcc[4] & 0x03) + 1;
    let mut reader = Reader::new(avcc, 5);
    let mut data = Vec::with_capacity(avcc.len() + 16);
    let sps = usize::from(reader.u8()? & 0x1f);
    reader.nal_entries(sps, &mut data)?;
    let pps = usize::from(reader.u8()?);
    reader.nal_entries(pps, &mut data)?;
    Some(AnnexB {
        data,
        nal_length_size,
    })
}

/// Convert an `hvcC` record into Annex B VPS/SPS/PPS (and any other arrays).
pub fn hvcc_to_annexb(hvcc: &[u8]) -> Option<AnnexB> {
    if hvcc.len() < 23 || hvcc[0] != 1 {
        return None;
    }
    let nal_length_size = (hvcc[21] & 0x03) + 1;
    let arrays = hvcc[22];
    let mut reader = Reader::new(hvcc, 23);
    let mut data = Vec::with_capacity(hvcc.len() + 32);
    for _ in 0..arrays {
        let _nal_type = reader.u8()?;
        let count = usize::from(reader.u16()?);
        reader.nal_entries(count, &mut data)?;
    }
    Some(AnnexB {
        data,
        nal_length_size,
    })
}

/// `(profile_idc, level_idc)` from an `avcC` record or an Annex B stream holding an SPS.
pub fn h264_profile_level(extra: &[u8]) -> Option<(u8, u8)> {
    if is_avcc(extra) {
        return Some((extra[1], extra[3]));
    }
    let mut i = 0;
    while i + 3 < extra.len() {
        if extra[i] == 0 && extra[i + 1] == 0 && extra[i + 2] == 1 {
            let header = extra[i + 3];
            if header & 0x1f == 7 {
                let profile = *extra.get(i + 4)?;
                let level = *extra.get(i + 6)?;
                return Some((profile, level));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    None
}

const WMV3_SEQUENCE_TEMPLATE: [u8; 36] = [
    0xff, 0xff, 0xff, 0xc5, // frame count, marker
    0x04, 0x00, 0x00, 0x00, // marker
    0x00, 0x00, 0x00, 0x00, // struct C
    0x00, 0x00, 0x00, 0x00, // vertical size
    0x00, 0x00, 0x00, 0x00, // horizontal size
    0x0c, 0x00, 0x00, 0x00, // marker
    0xff, 0xff, 0x00, 0x80, // level 4, cbr 0, hrd buffer
    0xff, 0xff, 0x00, 0x00, // hrd rate
    0xff, 0xff, 0xff, 0xff, // framerate
];

/// Build the 36-byte VC-1 simple/main sequence layer from WMV3 extradata.
///
/// `None` when `extra` holds fewer than the four bytes of struct C.
pub fn wmv3_sequence_header(extra: &[u8], width: u32, height: u32) -> Option<[u8; 36]> {
    let struct_c = extra.get(..4)?;
    let mut seq = WMV3_SEQUENCE_TEMPLATE;
    seq[8..12].copy_from_slice(struct_c);
    let profile = seq[8] >> 6;
    seq[8] = (seq[8] & 0x0f) | (profile << 4);
    seq[12..16].copy_from_slice(&height.to_le_bytes());
    seq[16..20].copy_from_slice(&width.to_le_bytes());
    Some(seq)
}

/// NAL length size of sample data described by `fmt`, when it is length-prefixed.
pub fn nal_length_size(fmt: &EsFormat) -> Option<u8> {
    if fmt.codec == codes::H264 && is_avcc(&fmt.extra) {
        Some((fmt.extra[4] & 0x03) + 1)
    } else if fmt.codec == codes::HEVC && !fmt.extra.is_empty() && !is_annexb(&fmt.extra) {
        hvcc_to_annexb(&fmt.extra).map(|a| a.nal_length_size)
    } else {
        None
    }
}

/// Turn the extradata of `fmt` into the configuration unit a decoder expects.
///
/// Returns `None` when there is nothing to send.
pub fn prepare_codec_config(fmt: &EsFormat) -> Option<CodecConfig> {
    if fmt.extra.is_empty() {
        return None;
    }
    if fmt.codec == codes::H264
        && let Some(annexb) = avcc_to_annexb(&fmt.extra)
    {
        return Some(CodecConfig {
            data: annexb.data,
            nal_length_size: Some(annexb.nal_length_size),
        });
    }
    if fmt.codec == codes::HEVC
        && !is_annexb(&fmt.extra)
        && let Some(annexb) = hvcc_to_annexb(&fmt.extra)
    {
        return Some(CodecConfig {
            data: annexb.data,
            nal_length_size: Some(annexb.nal_length_size),
        });
    }
    if fmt.codec == codes::WMV3
        && let Some(video) = fmt.as_video()
        && let Some(seq) = wmv3_sequence_header(&fmt.extra, video.width, video.height)
    {
        return Some(CodecConfig {
            data: seq.to_vec(),
            nal_length_size: None,
        });
    }
    Some(CodecConfig {
        data: fmt.extra.clone(),
        nal_length_size: None,
    })
}
