//! Copy-out of decoded pictures from native output buffers.
//!
//! Native buffers carry padding described by stride and slice height; [`FrameConverter`]
//! turns one into a tightly packed picture. Layout conversion proper is left to the
//! pipeline; [`PackedCopy`] only strips padding.
use ilkit_core::prelude::FourCc;

use crate::{
    chroma::{CHROMA_TABLE, is_tiled},
    native::ColorFormat,
};

/// Geometry of a picture as laid out by the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeLayout {
    pub chroma: FourCc,
    /// Native color format the component writes.
    pub color: ColorFormat,
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in lines.
    pub height: u32,
    /// Bytes per luma line, padding included.
    pub stride: u32,
    /// Lines per luma plane, padding included.
    pub slice_height: u32,
    /// Luma-to-chroma pitch divider; zero for packed formats.
    pub chroma_div: u32,
    /// Bytes per pixel of the first plane.
    pub line_mul: u32,
    /// Lines to skip at the top of every plane.
    pub crop_top: u32,
}

impl NativeLayout {
    /// Layout of `chroma` with component-reported padding.
    ///
    /// A zero `stride` or `slice_height` means "no padding".
    pub fn new(chroma: FourCc, width: u32, height: u32, stride: u32, slice_height: u32) -> Option<Self> {
        let row = CHROMA_TABLE.iter().find(|l| l.chroma == chroma)?;
        let packed_line = width.saturating_mul(row.line_mul);
        Some(Self {
            chroma,
            color: row.color,
            width,
            height,
            stride: if stride == 0 { packed_line } else { stride.max(packed_line) },
            slice_height: if slice_height == 0 { height } else { slice_height.max(height) },
            chroma_div: row.chroma_div,
            line_mul: row.line_mul,
            crop_top: 0,
        })
    }

    /// Same geometry, as written in the vendor variant `color` of the format.
    pub fn with_color(mut self, color: ColorFormat) -> Self {
        self.color = color;
        self
    }

    /// Size of the packed picture this layout converts to.
    pub fn packed_size(&self) -> usize {
        let luma = self.width as usize * self.line_mul as usize * self.height as usize;
        match self.chroma_div {
            0 => luma,
            _ => luma + luma / 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("native buffer holds {actual} bytes, layout needs {needed}")]
    Truncated { needed: usize, actual: usize },
    #[error("unsupported picture format {0}")]
    Unsupported(FourCc),
    #[error("tiled picture layout {0:?} cannot be copied line by line")]
    Tiled(ColorFormat),
}

/// Turns a native picture into the pipeline's representation.
pub trait FrameConverter: Send + Sync {
    fn convert(&self, layout: &NativeLayout, src: &[u8]) -> Result<Vec<u8>, ConvertError>;
}

/// Plane-by-plane copy that drops stride and slice-height padding.
///
/// Tiled layouts are refused with [`ConvertError::Tiled`].
///
/// # Example
/// ```rust
/// use ilkit_component::convert::{FrameConverter, NativeLayout, PackedCopy};
/// use ilkit_core::prelude::codes;
///
/// // 2x2 NV12 with a 4-byte stride and no vertical padding.
/// let layout = NativeLayout::new(codes::NV12, 2, 2, 4, 2).unwrap();
/// let src = [1, 2, 0, 0, 3, 4, 0, 0, 9, 8, 0, 0];
/// let out = PackedCopy.convert(&layout, &src).unwrap();
/// assert_eq!(out, [1, 2, 3, 4, 9, 8]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedCopy;

struct Plane {
    offset: usize,
    pitch: usize,
    line: usize,
    lines: usize,
    skip: usize,
}

impl PackedCopy {
    fn planes(layout: &NativeLayout) -> Vec<Plane> {
        let stride = layout.stride as usize;
        let slice = layout.slice_height as usize;
        let width = layout.width as usize * layout.line_mul as usize;
        let height = layout.height as usize;
        let top = layout.crop_top as usize;
        let luma = Plane {
            offset: 0,
            pitch: stride,
            line: width,
            lines: height,
            skip: top,
        };
        match layout.chroma_div {
            0 => vec![luma],
            1 => vec![
                luma,
                Plane {
                    offset: stride * slice,
                    pitch: stride,
                    line: width,
                    lines: height / 2,
                    skip: top / 2,
                },
            ],
            div => {
                let pitch = stride / div as usize;
                let chroma_slice = pitch * (slice / 2);
                let chroma = |offset| Plane {
                    offset,
                    pitch,
                    line: width / div as usize,
                    lines: height / 2,
                    skip: top / 2,
                };
                vec![
                    luma,
                    chroma(stride * slice),
                    chroma(stride * slice + chroma_slice),
                ]
            }
        }
    }
}

impl FrameConverter for PackedCopy {
    fn convert(&self, layout: &NativeLayout, src: &[u8]) -> Result<Vec<u8>, ConvertError> {
        if is_tiled(layout.color) {
            return Err(ConvertError::Tiled(layout.color));
        }
        let mut out = Vec::with_capacity(layout.packed_size());
        for plane in Self::planes(layout) {
            for row in 0..plane.lines {
                let start = plane.offset + (row + plane.skip) * plane.pitch;
                let end = start + plane.line;
                let line = src.get(start..end).ok_or(ConvertError::Truncated {
                    needed: end,
                    actual: src.len(),
                })?;
                out.extend_from_slice(line);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilkit_core::prelude::codes;

    #[test]
    fn i420_planes_follow_slice_height() {
        // 4x2 visible, stride 8, slice height 4.
        let layout = NativeLayout::new(codes::I420, 4, 2, 8, 4).unwrap();
        let mut src = vec![0u8; 8 * 4 + 4 * 2 * 2];
        src[..4].copy_from_slice(&[1, 2, 3, 4]);
        src[8..12].copy_from_slice(&[5, 6, 7, 8]);
        src[32..34].copy_from_slice(&[10, 11]);
        src[40..42].copy_from_slice(&[20, 21]);
        let out = PackedCopy.convert(&layout, &src).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 20, 21]);
        assert_eq!(out.len(), layout.packed_size());
    }

    #[test]
    fn packed_422_copies_two_bytes_per_pixel() {
        let layout = NativeLayout::new(codes::UYVY, 2, 1, 0, 0).unwrap();
        assert_eq!(layout.stride, 4);
        let out = PackedCopy.convert(&layout, &[1, 2, 3, 4]).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn short_buffer_is_reported() {
        let layout = NativeLayout::new(codes::NV12, 4, 4, 4, 4).unwrap();
        let err = PackedCopy.convert(&layout, &[0; 10]).unwrap_err();
        assert!(matches!(err, ConvertError::Truncated { actual: 10, .. }));
    }

    #[test]
    fn crop_top_skips_lines() {
        let mut layout = NativeLayout::new(codes::NV12, 2, 2, 2, 4).unwrap();
        layout.crop_top = 2;
        let src = [0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 5, 6];
        assert_eq!(PackedCopy.convert(&layout, &src).unwrap(), [1, 2, 3, 4, 5, 6]);
        assert!(NativeLayout::new(codes::H264, 1, 1, 0, 0).is_none());
    }

    #[test]
    fn tiled_pictures_are_not_copied_as_lines() {
        let tile = crate::chroma::QCOM_YUV420_PACKED_SEMI_PLANAR_64X32_TILE;
        let layout = NativeLayout::new(codes::NV12, 128, 64, 128, 64)
            .unwrap()
            .with_color(tile);
        let src = vec![0u8; 128 * 64 * 3 / 2];
        assert_eq!(PackedCopy.convert(&layout, &src), Err(ConvertError::Tiled(tile)));

        let linear = layout.with_color(crate::chroma::QCOM_YUV420_PACKED_SEMI_PLANAR_32M);
        assert_eq!(PackedCopy.convert(&linear, &src).unwrap().len(), src.len());
    }
}
