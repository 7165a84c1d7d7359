//! Pixel and sample formats.

use serde::{Deserialize, Serialize};

/// Pixel layout of a decoded picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 channels, 8 bits each, R first.
    Rgba,
    /// 4 channels, 8 bits each, B first (most screen grabbers).
    Bgra,
    /// 3 channels, 8 bits each.
    Rgb24,
    /// Single 8-bit luma plane.
    Gray8,
    /// Planar Y, U, V with 2x2 chroma subsampling.
    Yuv420p,
    /// Y plane + interleaved UV at half resolution.
    Nv12,
    /// Opaque surface living in device memory. The real layout is the
    /// software format of the frame's frames context.
    Hw,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 7] = [
        Self::Rgba,
        Self::Bgra,
        Self::Rgb24,
        Self::Gray8,
        Self::Yuv420p,
        Self::Nv12,
        Self::Hw,
    ];

    /// Name as used in graph descriptions (`format=yuv420p`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Rgb24 => "rgb24",
            Self::Gray8 => "gray",
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Hw => "hw",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Bytes per pixel for packed formats, `None` for planar or hardware ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Rgba | Self::Bgra => Some(4),
            Self::Rgb24 => Some(3),
            Self::Gray8 => Some(1),
            Self::Yuv420p | Self::Nv12 | Self::Hw => None,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, Self::Yuv420p | Self::Nv12)
    }

    pub fn is_hardware(self) -> bool {
        matches!(self, Self::Hw)
    }

    /// Geometry of each plane for a `width` x `height` picture.
    pub fn planes(self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let plane = |width, height, bytes_per_pixel| PlaneLayout {
            width,
            height,
            bytes_per_pixel,
        };
        match self {
            Self::Yuv420p => vec![plane(w, h, 1), plane(cw, ch, 1), plane(cw, ch, 1)],
            Self::Nv12 => vec![plane(w, h, 1), plane(cw, ch, 2)],
            Self::Hw => Vec::new(),
            packed => vec![plane(w, h, packed.bytes_per_pixel().unwrap_or(0))],
        }
    }

    /// Byte size of each plane for a `width` x `height` picture.
    pub fn plane_sizes(self, width: u32, height: u32) -> Vec<usize> {
        self.planes(width, height)
            .iter()
            .map(PlaneLayout::size)
            .collect()
    }

    /// Total bytes for one picture.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.plane_sizes(width, height).iter().sum()
    }
}

/// One plane of a software picture: pixel columns, rows, bytes per pixel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
}

impl PlaneLayout {
    pub fn stride(&self) -> usize {
        self.width * self.bytes_per_pixel
    }

    pub fn size(&self) -> usize {
        self.stride() * self.height
    }
}

/// Storage format of encoded PCM samples.
///
/// Decoded audio always travels through the engine as interleaved `f32`;
/// this only describes what a codec writes out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    S16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16 => 2,
            Self::F32 => 4,
        }
    }

    pub fn bit_depth(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_sizes() {
        assert_eq!(PixelFormat::Rgba.bytes_per_pixel(), Some(4));
        assert_eq!(PixelFormat::Rgb24.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Nv12.bytes_per_pixel(), None);
        assert!(PixelFormat::Yuv420p.is_planar());
        assert!(PixelFormat::Hw.is_hardware());
    }

    #[test]
    fn plane_sizes_round_chroma_up() {
        assert_eq!(PixelFormat::Yuv420p.plane_sizes(4, 2), vec![8, 2, 2]);
        assert_eq!(PixelFormat::Yuv420p.plane_sizes(3, 3), vec![9, 4, 4]);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 4), 24);
        assert_eq!(PixelFormat::Bgra.frame_size(2, 2), 16);
    }

    #[test]
    fn names_round_trip() {
        for fmt in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_name(fmt.name()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_name("p010"), None);
    }

    #[test]
    fn sample_format_depth() {
        assert_eq!(SampleFormat::S16.bit_depth(), 16);
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 4);
    }
}
