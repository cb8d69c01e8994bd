//! Raw picture formats understood on native ports and their buffer geometry.
use ilkit_core::prelude::{FourCc, codes};

use crate::native::ColorFormat;

/// TI packed semi-planar 4:2:0; crop offsets shift its slice height.
pub const TI_YUV420_PACKED_SEMI_PLANAR: ColorFormat = ColorFormat::Vendor(0x7F00_0100);
/// Qualcomm 64x32 tiled NV12.
pub const QCOM_YUV420_PACKED_SEMI_PLANAR_64X32_TILE: ColorFormat = ColorFormat::Vendor(0x7FA3_0C03);
/// Qualcomm NV12 with 32-line alignment.
pub const QCOM_YUV420_PACKED_SEMI_PLANAR_32M: ColorFormat = ColorFormat::Vendor(0x7FA3_0C04);

/// Layout parameters of one raw picture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChromaLayout {
    pub chroma: FourCc,
    pub color: ColorFormat,
    /// Frame size is `width * height * size_mul / 2`.
    pub size_mul: u32,
    /// Luma pitch is `width * line_mul`.
    pub line_mul: u32,
    /// Divider from luma pitch to chroma pitch; zero for packed formats.
    pub chroma_div: u32,
}

const fn layout(
    chroma: FourCc,
    color: ColorFormat,
    size_mul: u32,
    line_mul: u32,
    chroma_div: u32,
) -> ChromaLayout {
    ChromaLayout {
        chroma,
        color,
        size_mul,
        line_mul,
        chroma_div,
    }
}

pub static CHROMA_TABLE: &[ChromaLayout] = &[
    layout(codes::I420, ColorFormat::Yuv420Planar, 3, 1, 2),
    layout(codes::NV12, ColorFormat::Yuv420SemiPlanar, 3, 1, 1),
    layout(codes::NV21, ColorFormat::Yvu420SemiPlanar, 3, 1, 1),
    layout(codes::NV12, TI_YUV420_PACKED_SEMI_PLANAR, 3, 1, 1),
    layout(codes::NV12, QCOM_YUV420_PACKED_SEMI_PLANAR_64X32_TILE, 3, 1, 1),
    layout(codes::NV12, QCOM_YUV420_PACKED_SEMI_PLANAR_32M, 3, 1, 1),
    layout(codes::YUYV, ColorFormat::YCbYCr, 4, 2, 0),
    layout(codes::YVYU, ColorFormat::YCrYCb, 4, 2, 0),
    layout(codes::UYVY, ColorFormat::CbYCrY, 4, 2, 0),
    layout(codes::VYUY, ColorFormat::CrYCbY, 4, 2, 0),
];

/// Sizes derived for one picture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChromaSizes {
    pub frame_size: u32,
    pub stride: u32,
    pub chroma_div: u32,
}

/// Round up to the next macroblock boundary.
pub fn align16(value: u32) -> u32 {
    value.saturating_add(15) & !0xF
}

/// Native color format for a raw picture code.
pub fn color_format(chroma: FourCc) -> Option<ColorFormat> {
    CHROMA_TABLE
        .iter()
        .find(|l| l.chroma == chroma)
        .map(|l| l.color)
}

/// Whether pixels of `color` are stored in macroblock tiles rather than lines.
pub fn is_tiled(color: ColorFormat) -> bool {
    color == QCOM_YUV420_PACKED_SEMI_PLANAR_64X32_TILE
}

/// Raw picture code for a native color format.
pub fn chroma_of(color: ColorFormat) -> Option<FourCc> {
    CHROMA_TABLE
        .iter()
        .find(|l| l.color == color)
        .map(|l| l.chroma)
}

/// Buffer geometry of a `width` x `height` picture, aligned to macroblocks.
///
/// # Example
/// ```rust
/// use ilkit_component::chroma::chroma_sizes;
/// use ilkit_core::prelude::codes;
///
/// let sizes = chroma_sizes(codes::I420, 1280, 720).unwrap();
/// assert_eq!(sizes.frame_size, 1280 * 720 * 3 / 2);
/// assert_eq!(sizes.stride, 1280);
/// assert_eq!(sizes.chroma_div, 2);
/// ```
pub fn chroma_sizes(chroma: FourCc, width: u32, height: u32) -> Option<ChromaSizes> {
    let layout = CHROMA_TABLE.iter().find(|l| l.chroma == chroma)?;
    let width = align16(width);
    let height = align16(height);
    Some(ChromaSizes {
        frame_size: width
            .saturating_mul(height)
            .saturating_mul(layout.size_mul)
            / 2,
        stride: width.saturating_mul(layout.line_mul),
        chroma_div: layout.chroma_div,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_geometry_rounds_up_to_macroblocks() {
        let sizes = chroma_sizes(codes::NV12, 1920, 1080).unwrap();
        assert_eq!(sizes.frame_size, 1920 * 1088 * 3 / 2);
        assert_eq!(sizes.chroma_div, 1);
    }

    #[test]
    fn packed_422_doubles_the_pitch() {
        let sizes = chroma_sizes(codes::UYVY, 100, 50).unwrap();
        assert_eq!(sizes.stride, 112 * 2);
        assert_eq!(sizes.frame_size, 112 * 64 * 2);
        assert_eq!(sizes.chroma_div, 0);
    }

    #[test]
    fn vendor_formats_resolve_to_nv12() {
        assert_eq!(chroma_of(TI_YUV420_PACKED_SEMI_PLANAR), Some(codes::NV12));
        assert_eq!(color_format(codes::NV12), Some(ColorFormat::Yuv420SemiPlanar));
        assert_eq!(chroma_of(ColorFormat::Vendor(1)), None);
        assert!(chroma_sizes(codes::H264, 16, 16).is_none());
    }

    #[test]
    fn only_the_qualcomm_tile_layout_is_tiled() {
        assert!(is_tiled(QCOM_YUV420_PACKED_SEMI_PLANAR_64X32_TILE));
        assert!(!is_tiled(QCOM_YUV420_PACKED_SEMI_PLANAR_32M));
        assert!(!is_tiled(ColorFormat::Yuv420SemiPlanar));
    }
}
