//! Codec and container identifiers understood by the encoder.

use serde::{Deserialize, Serialize};

use crate::color::SampleFormat;

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    /// Uncompressed pictures, stored as-is.
    RawVideo,
}

impl VideoCodec {
    pub fn name(self) -> &'static str {
        match self {
            Self::RawVideo => "rawvideo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rawvideo" | "raw" => Some(Self::RawVideo),
            _ => None,
        }
    }

    /// Matroska CodecID.
    pub fn matroska_id(self) -> &'static str {
        match self {
            Self::RawVideo => "V_UNCOMPRESSED",
        }
    }
}

/// Audio codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    /// Signed 16-bit little-endian PCM.
    PcmS16le,
    /// 32-bit float little-endian PCM.
    PcmF32le,
}

impl AudioCodec {
    pub fn name(self) -> &'static str {
        match self {
            Self::PcmS16le => "pcm_s16le",
            Self::PcmF32le => "pcm_f32le",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pcm_s16le" => Some(Self::PcmS16le),
            "pcm_f32le" => Some(Self::PcmF32le),
            _ => None,
        }
    }

    pub fn sample_format(self) -> SampleFormat {
        match self {
            Self::PcmS16le => SampleFormat::S16,
            Self::PcmF32le => SampleFormat::F32,
        }
    }

    /// Matroska CodecID.
    pub fn matroska_id(self) -> &'static str {
        match self {
            Self::PcmS16le => "A_PCM/INT/LIT",
            Self::PcmF32le => "A_PCM/FLOAT/IEEE",
        }
    }
}

/// Output container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// Matroska (MKV / MKA).
    Matroska,
}

impl ContainerFormat {
    pub fn file_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Matroska => &["mkv", "mka"],
        }
    }

    /// Pick a container from a destination path's extension.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        [Self::Matroska]
            .into_iter()
            .find(|c| c.file_extensions().contains(&ext.as_str()))
    }
}
