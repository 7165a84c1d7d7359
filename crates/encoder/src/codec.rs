//! Built-in codecs.
//!
//! Both are packetizers: `rawvideo` stores the picture planes back to back,
//! the PCM codecs convert the engine's interleaved `f32` samples to the
//! stored sample format.

use byteorder::{LittleEndian, WriteBytesExt};
use capline_common::{
    AudioCodec, AudioFrame, MediaKind, PixelFormat, SampleFormat, VideoCodec, VideoFrame,
};
use capline_gpu_hal::EncoderHwState;

use crate::error::EncodeError;

// ── Video ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VideoEncoder {
    codec: VideoCodec,
    format: PixelFormat,
    width: u32,
    height: u32,
    plane_sizes: Vec<usize>,
}

impl VideoEncoder {
    pub fn open(name: &str, format: PixelFormat, width: u32, height: u32) -> Result<Self, EncodeError> {
        let codec = VideoCodec::from_name(name).ok_or_else(|| EncodeError::UnknownCodec {
            kind: MediaKind::Video,
            name: name.to_string(),
        })?;
        if width == 0 || height == 0 {
            return Err(EncodeError::Unsupported {
                codec: codec.name(),
                reason: format!("invalid picture size {width}x{height}"),
            });
        }
        if format.is_hardware() {
            return Err(EncodeError::Unsupported {
                codec: codec.name(),
                reason: "stored pixel format must be a software layout".into(),
            });
        }
        Ok(Self {
            codec,
            format,
            width,
            height,
            plane_sizes: format.plane_sizes(width, height),
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes of one encoded picture.
    pub fn packet_size(&self) -> usize {
        self.plane_sizes.iter().sum()
    }

    /// Encode one picture. Device surfaces are read back through the
    /// frames context the encoder was bound to.
    pub fn encode(&self, pic: &VideoFrame, hw: &EncoderHwState) -> Result<Vec<u8>, EncodeError> {
        let layout = if pic.format.is_hardware() {
            let bound = hw
                .frames
                .as_ref()
                .ok_or_else(|| EncodeError::Hardware("encoder has no frames context".into()))?;
            let surface = pic
                .hw
                .as_ref()
                .ok_or_else(|| EncodeError::Hardware("surface carries no frames context".into()))?;
            if surface.device != bound.device {
                return Err(EncodeError::Hardware(format!(
                    "surface lives on {}, encoder is bound to {}",
                    surface.device, bound.device
                )));
            }
            surface.sw_format
        } else {
            pic.format
        };

        if layout != self.format {
            return Err(EncodeError::mismatch(format!(
                "{} picture, stream stores {}",
                layout.name(),
                self.format.name()
            )));
        }
        if (pic.width, pic.height) != (self.width, self.height) {
            return Err(EncodeError::mismatch(format!(
                "{}x{} picture, stream is {}x{}",
                pic.width, pic.height, self.width, self.height
            )));
        }
        if pic.planes.len() != self.plane_sizes.len()
            || pic.planes.iter().zip(&self.plane_sizes).any(|(p, &size)| p.len() < size)
        {
            return Err(EncodeError::mismatch("picture planes are shorter than the layout"));
        }

        let mut packet = Vec::with_capacity(self.packet_size());
        for (plane, &size) in pic.planes.iter().zip(&self.plane_sizes) {
            packet.extend_from_slice(&plane[..size]);
        }
        Ok(packet)
    }
}

// ── Audio ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct AudioEncoder {
    codec: AudioCodec,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
}

impl AudioEncoder {
    pub fn open(
        name: &str,
        sample_rate: u32,
        channels: u16,
        frame_size: usize,
    ) -> Result<Self, EncodeError> {
        let codec = AudioCodec::from_name(name).ok_or_else(|| EncodeError::UnknownCodec {
            kind: MediaKind::Audio,
            name: name.to_string(),
        })?;
        if sample_rate == 0 || channels == 0 || frame_size == 0 {
            return Err(EncodeError::Unsupported {
                codec: codec.name(),
                reason: format!(
                    "invalid layout: {sample_rate} Hz, {channels} channels, {frame_size} samples per block"
                ),
            });
        }
        Ok(Self {
            codec,
            sample_rate,
            channels,
            frame_size,
        })
    }

    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel in every block but the last.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Reject blocks the stream was not opened for.
    pub fn check(&self, block: &AudioFrame) -> Result<(), EncodeError> {
        if block.sample_rate != self.sample_rate || block.channels != self.channels {
            return Err(EncodeError::mismatch(format!(
                "{} Hz / {} ch block, stream is {} Hz / {} ch",
                block.sample_rate, block.channels, self.sample_rate, self.channels
            )));
        }
        Ok(())
    }

    /// Encode interleaved samples.
    pub fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, EncodeError> {
        let format = self.codec.sample_format();
        let mut packet = Vec::with_capacity(samples.len() * format.bytes_per_sample());
        match format {
            SampleFormat::S16 => {
                for &s in samples {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                    packet.write_i16::<LittleEndian>(v)?;
                }
            }
            SampleFormat::F32 => {
                for &s in samples {
                    packet.write_f32::<LittleEndian>(s)?;
                }
            }
        }
        Ok(packet)
    }
}
