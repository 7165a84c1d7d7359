//! Decoded media frames and stream descriptions.
//!
//! A [`Frame`] is owned by exactly one stage at a time: it moves through
//! ring buffers and channels and is never cloned on the hot path.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::color::PixelFormat;
use crate::hw::FramesContext;
use crate::types::{rescale, Rational, NOPTS};

/// Media type of a frame or stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [Self::Video, Self::Audio];

    /// Slot for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded picture. Planes are tightly packed (stride == row width).
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Vec<u8>>,
    /// Set when the picture lives in device memory.
    pub hw: Option<Arc<FramesContext>>,
}

impl VideoFrame {
    /// Zero-filled picture.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let planes = format
            .plane_sizes(width, height)
            .into_iter()
            .map(|size| vec![0u8; size])
            .collect();
        Self {
            format,
            width,
            height,
            planes,
            hw: None,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }
}

/// Decoded audio block, interleaved `f32` in `[-1.0, 1.0]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn silence(sample_rate: u32, channels: u16, nb_samples: usize) -> Self {
        Self::new(sample_rate, channels, vec![0.0; nb_samples * channels as usize])
    }

    /// Samples per channel.
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Frame payload.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameData {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// One decoded unit of audio or video.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Presentation timestamp in `time_base` units.
    pub pts: Option<i64>,
    pub time_base: Rational,
    /// Duration in `time_base` units (0 when unknown).
    pub duration: i64,
    pub data: FrameData,
}

impl Frame {
    pub fn video(picture: VideoFrame, pts: Option<i64>, time_base: Rational) -> Self {
        Self {
            pts,
            time_base,
            duration: 0,
            data: FrameData::Video(picture),
        }
    }

    /// Audio frames derive their duration from the sample count.
    pub fn audio(block: AudioFrame, pts: Option<i64>, time_base: Rational) -> Self {
        let duration = if block.sample_rate > 0 {
            rescale(
                block.nb_samples() as i64,
                Rational::new(1, block.sample_rate as i32),
                time_base,
            )
        } else {
            0
        };
        Self {
            pts,
            time_base,
            duration,
            data: FrameData::Audio(block),
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn kind(&self) -> MediaKind {
        match self.data {
            FrameData::Video(_) => MediaKind::Video,
            FrameData::Audio(_) => MediaKind::Audio,
        }
    }

    /// `pts`, or [`NOPTS`] when unset.
    pub fn pts_or_nopts(&self) -> i64 {
        self.pts.unwrap_or(NOPTS)
    }

    /// `pts + duration`, if the frame has a timestamp.
    pub fn end_pts(&self) -> Option<i64> {
        self.pts.map(|pts| pts + self.duration)
    }

    /// Move the frame into another time base, rescaling pts and duration.
    pub fn rescale_to(&mut self, time_base: Rational) {
        if self.time_base == time_base {
            return;
        }
        self.pts = self.pts.map(|pts| rescale(pts, self.time_base, time_base));
        self.duration = rescale(self.duration, self.time_base, time_base);
        self.time_base = time_base;
    }

    pub fn nb_samples(&self) -> usize {
        match &self.data {
            FrameData::Audio(a) => a.nb_samples(),
            FrameData::Video(_) => 0,
        }
    }

    pub fn as_video(&self) -> Option<&VideoFrame> {
        match &self.data {
            FrameData::Video(v) => Some(v),
            FrameData::Audio(_) => None,
        }
    }

    pub fn as_video_mut(&mut self) -> Option<&mut VideoFrame> {
        match &mut self.data {
            FrameData::Video(v) => Some(v),
            FrameData::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioFrame> {
        match &self.data {
            FrameData::Audio(a) => Some(a),
            FrameData::Video(_) => None,
        }
    }

    pub fn as_audio_mut(&mut self) -> Option<&mut AudioFrame> {
        match &mut self.data {
            FrameData::Audio(a) => Some(a),
            FrameData::Video(_) => None,
        }
    }
}

/// What a producer emits (or a consumer expects) for one media kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamFormat {
    Video {
        format: PixelFormat,
        width: u32,
        height: u32,
        frame_rate: Rational,
        time_base: Rational,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        time_base: Rational,
    },
}

impl StreamFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video { .. } => MediaKind::Video,
            Self::Audio { .. } => MediaKind::Audio,
        }
    }

    pub fn time_base(&self) -> Rational {
        match self {
            Self::Video { time_base, .. } | Self::Audio { time_base, .. } => *time_base,
        }
    }
}
