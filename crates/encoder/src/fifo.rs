//! Sample FIFO between decoded audio and fixed-size codec blocks.
//!
//! Producers hand over blocks of whatever length the source happens to
//! decode. PCM codecs in a container want a steady block size, so samples
//! collect here and leave only in `frame_size` chunks. At end of stream the
//! remainder is released as one final short block.

use std::collections::VecDeque;

/// One block drained from the FIFO. `pts` counts samples (time base
/// `1/sample_rate`).
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    pub pts: i64,
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub nb_samples: usize,
}

#[derive(Debug)]
pub struct AudioFifo {
    channels: usize,
    samples: VecDeque<f32>,
    /// Timestamp of the first buffered sample.
    head_pts: Option<i64>,
}

impl AudioFifo {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            samples: VecDeque::new(),
            head_pts: None,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Buffered samples per channel.
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp just past the last buffered sample. Stays valid after the
    /// FIFO was drained.
    pub fn end_pts(&self) -> Option<i64> {
        self.head_pts.map(|pts| pts + self.len() as i64)
    }

    /// Append interleaved samples. `pts` only matters when the FIFO is
    /// empty; otherwise the new samples continue the buffered ones.
    pub fn write(&mut self, samples: &[f32], pts: Option<i64>) {
        let whole = samples.len() - samples.len() % self.channels;
        if whole == 0 {
            return;
        }
        if self.samples.is_empty() {
            if let Some(pts) = pts {
                self.head_pts = Some(pts);
            }
        }
        self.samples.extend(&samples[..whole]);
    }

    /// Take exactly `frame_size` samples per channel, if that many are buffered.
    pub fn read(&mut self, frame_size: usize) -> Option<AudioBlock> {
        if frame_size == 0 || self.len() < frame_size {
            return None;
        }
        Some(self.take(frame_size))
    }

    /// Drain everything left as one block, possibly shorter than a frame.
    pub fn flush(&mut self) -> Option<AudioBlock> {
        if self.is_empty() {
            return None;
        }
        let n = self.len();
        Some(self.take(n))
    }

    fn take(&mut self, nb_samples: usize) -> AudioBlock {
        let pts = self.head_pts.unwrap_or(0);
        let samples: Vec<f32> = self.samples.drain(..nb_samples * self.channels).collect();
        self.head_pts = Some(pts + nb_samples as i64);
        AudioBlock {
            pts,
            samples,
            nb_samples,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.head_pts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize, channels: usize, value: f32) -> Vec<f32> {
        vec![value; n * channels]
    }

    #[test]
    fn uneven_blocks_yield_one_frame_and_a_remainder() {
        let mut fifo = AudioFifo::new(2);
        let mut out = Vec::new();
        for n in [512, 512, 64] {
            fifo.write(&block(n, 2, 0.25), Some(0));
            while let Some(b) = fifo.read(1024) {
                out.push(b);
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].nb_samples, 1024);
        assert_eq!(out[0].samples.len(), 2048);
        assert_eq!(fifo.len(), 64);

        let tail = fifo.flush().unwrap();
        assert_eq!(tail.nb_samples, 64);
        assert_eq!(tail.pts, 1024);
        assert!(fifo.is_empty());
        assert!(fifo.flush().is_none());
    }

    #[test]
    fn order_is_preserved_across_writes() {
        let mut fifo = AudioFifo::new(1);
        fifo.write(&[1.0, 2.0, 3.0], Some(100));
        fifo.write(&[4.0, 5.0], Some(999));
        let b = fifo.read(4).unwrap();
        assert_eq!(b.samples, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(b.pts, 100);
        assert_eq!(fifo.end_pts(), Some(105));
        assert_eq!(fifo.flush().unwrap().pts, 104);
        assert_eq!(fifo.end_pts(), Some(105));
    }

    #[test]
    fn empty_fifo_resyncs_to_incoming_pts() {
        let mut fifo = AudioFifo::new(1);
        fifo.write(&[0.0; 4], Some(0));
        fifo.read(4).unwrap();
        fifo.write(&[0.0; 4], Some(48_000));
        assert_eq!(fifo.read(4).unwrap().pts, 48_000);
    }

    #[test]
    fn partial_frames_are_ignored() {
        let mut fifo = AudioFifo::new(2);
        fifo.write(&[0.1, 0.2, 0.3], None);
        assert_eq!(fifo.len(), 1);
        assert!(fifo.read(0).is_none());
        fifo.clear();
        assert!(fifo.is_empty());
    }
}
