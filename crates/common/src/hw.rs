//! Hardware acceleration identifiers shared between the device registry,
//! the processing graph and the encoder.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::color::PixelFormat;

/// Kind of acceleration device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Vaapi,
    Cuda,
    Qsv,
    Vulkan,
    VideoToolbox,
    D3d11va,
}

impl DeviceType {
    pub const ALL: [DeviceType; 6] = [
        Self::Vaapi,
        Self::Cuda,
        Self::Qsv,
        Self::Vulkan,
        Self::VideoToolbox,
        Self::D3d11va,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Vaapi => "vaapi",
            Self::Cuda => "cuda",
            Self::Qsv => "qsv",
            Self::Vulkan => "vulkan",
            Self::VideoToolbox => "videotoolbox",
            Self::D3d11va => "d3d11va",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static NEXT_FRAMES_ID: AtomicU64 = AtomicU64::new(1);

/// Pool description for frames held in device memory.
///
/// Produced by an upload node of the processing graph and reused by the
/// encoder so both sides agree on surface size and layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramesContext {
    pub id: u64,
    pub device: DeviceType,
    /// Layout of the surfaces when downloaded.
    pub sw_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FramesContext {
    pub fn new(device: DeviceType, sw_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            id: NEXT_FRAMES_ID.fetch_add(1, Ordering::Relaxed),
            device,
            sw_format,
            width,
            height,
        }
    }
}
