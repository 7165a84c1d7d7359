//! Encoder statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use capline_common::MediaKind;
use serde::Serialize;

/// Snapshot of an encoder's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EncoderStats {
    /// Pictures written, synthetic repeats included.
    pub video_frames: u64,
    /// Audio blocks written.
    pub audio_blocks: u64,
    /// Audio samples per channel written.
    pub audio_samples: u64,
    /// Pictures re-emitted to fill constant-frame-rate gaps.
    pub repeated_frames: u64,
    /// Frames rejected by `consume` or dropped as late, per kind.
    pub dropped: [u64; 2],
    /// Encoded payload bytes handed to the container.
    pub bytes_written: u64,
}

impl EncoderStats {
    pub fn dropped(&self, kind: MediaKind) -> u64 {
        self.dropped[kind.index()]
    }
}

/// Live counters shared between the encoder handle and its worker.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    video_frames: AtomicU64,
    audio_blocks: AtomicU64,
    audio_samples: AtomicU64,
    repeated_frames: AtomicU64,
    dropped: [AtomicU64; 2],
    bytes_written: AtomicU64,
}

impl Counters {
    pub fn video_frame(&self, bytes: usize, repeated: bool) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        if repeated {
            self.repeated_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn audio_block(&self, nb_samples: usize, bytes: usize) {
        self.audio_blocks.fetch_add(1, Ordering::Relaxed);
        self.audio_samples.fetch_add(nb_samples as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn drop_frame(&self, kind: MediaKind) {
        self.dropped[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EncoderStats {
        EncoderStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_blocks: self.audio_blocks.load(Ordering::Relaxed),
            audio_samples: self.audio_samples.load(Ordering::Relaxed),
            repeated_frames: self.repeated_frames.load(Ordering::Relaxed),
            dropped: [
                self.dropped[0].load(Ordering::Relaxed),
                self.dropped[1].load(Ordering::Relaxed),
            ],
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
