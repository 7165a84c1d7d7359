//! Audio side of playback: queued blocks in, stretched device frames out,
//! and the media position of the next frame to be heard.

use capline_audio::{Resampler, RendererOptions, TimeStretcher};
use capline_common::{to_nanos, Frame, SafeQueue};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

pub(crate) struct AudioClock {
    out_rate: u32,
    out_channels: u16,
    /// Rebuilt whenever the input rate changes.
    resampler: Option<Resampler>,
    stretcher: TimeStretcher,
    /// Media time just past the last sample fed, in nanoseconds.
    audio_pts_ns: Option<i64>,
    flushed: bool,
}

impl AudioClock {
    pub fn new(output: &RendererOptions) -> Self {
        Self {
            out_rate: output.sample_rate.max(1),
            out_channels: output.channels.max(1),
            resampler: None,
            stretcher: TimeStretcher::new(output.sample_rate, output.channels),
            audio_pts_ns: None,
            flushed: false,
        }
    }

    pub fn channels(&self) -> usize {
        self.out_channels as usize
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.stretcher.set_speed(speed);
    }

    /// Pull queued blocks until at least `target` device frames are
    /// buffered. When the queue runs dry after the source ended, the
    /// stretcher is flushed so its last grain is released.
    pub fn fill(&mut self, queue: &SafeQueue<Frame>, target: usize, source_ended: bool) {
        while self.stretcher.buffered() < target {
            match queue.try_pop() {
                Some(frame) => self.feed(&frame),
                None => {
                    if source_ended && !self.flushed {
                        self.stretcher.flush();
                        self.flushed = true;
                    }
                    break;
                }
            }
        }
    }

    fn feed(&mut self, frame: &Frame) {
        let Some(block) = frame.as_audio() else {
            return;
        };
        let nb_samples = block.nb_samples();
        if nb_samples == 0 || block.sample_rate == 0 {
            return;
        }
        if let Some(pts) = frame.pts {
            self.audio_pts_ns = Some(to_nanos(pts, frame.time_base));
        }
        let span_ns = (nb_samples as f64 * NANOS_PER_SEC / block.sample_rate as f64) as i64;
        self.audio_pts_ns = self.audio_pts_ns.map(|pts| pts + span_ns);

        let samples = remap_channels(&block.samples, block.channels, self.out_channels);
        let samples = if block.sample_rate == self.out_rate {
            samples
        } else {
            if self.resampler.as_ref().map(Resampler::from_rate) != Some(block.sample_rate) {
                self.resampler = Some(Resampler::new(
                    block.sample_rate,
                    self.out_rate,
                    self.out_channels,
                ));
            }
            match &mut self.resampler {
                Some(r) => r.process(&samples),
                None => samples,
            }
        };
        self.stretcher.write(&samples);
        self.flushed = false;
    }

    /// Media time of the first frame the next [`read`](Self::read) returns,
    /// once `device_frames` already handed to the device have played out.
    pub fn position_ns(&self, device_frames: usize, speed: f64) -> Option<i64> {
        let pending = (self.stretcher.buffered() + device_frames) as f64;
        let media_ns = pending * NANOS_PER_SEC / self.out_rate as f64 * speed;
        self.audio_pts_ns.map(|pts| pts - media_ns as i64)
    }

    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.stretcher.read(out)
    }

    /// The source ended and every sample has been read out.
    pub fn drained(&self) -> bool {
        self.flushed && self.stretcher.buffered() == 0
    }

    pub fn buffered(&self) -> usize {
        self.stretcher.buffered()
    }

    /// Forget everything, as after a seek.
    pub fn reset(&mut self) {
        self.stretcher.clear();
        if let Some(r) = &mut self.resampler {
            r.reset();
        }
        self.audio_pts_ns = None;
        self.flushed = false;
    }
}

/// Up/down-mix interleaved samples between channel counts. Mono is spread
/// to every output channel; downmix to mono averages.
fn remap_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat(frame[0]).take(to));
        } else if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            out.extend((0..to).map(|c| frame.get(c).copied().unwrap_or(0.0)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::{AudioFrame, Rational};

    fn options(rate: u32, channels: u16) -> RendererOptions {
        RendererOptions {
            sample_rate: rate,
            channels,
            period_frames: 100,
        }
    }

    fn block(pts: i64, n: usize, rate: u32, channels: u16) -> Frame {
        let block = AudioFrame::new(rate, channels, vec![0.5; n * channels as usize]);
        Frame::audio(block, Some(pts), Rational::new(1, rate as i32))
    }

    #[test]
    fn position_backs_off_by_buffered_frames() {
        let queue = SafeQueue::new();
        for i in 0..4 {
            queue.push(block(i * 1000, 1000, 8000, 1)).unwrap();
        }
        let mut clock = AudioClock::new(&options(8000, 1));
        clock.fill(&queue, 2500, false);
        // three blocks fed, 3000 frames buffered, audio_pts at 375 ms
        assert_eq!(clock.buffered(), 3000);
        assert_eq!(queue.len(), 1);
        assert_eq!(clock.position_ns(0, 1.0), Some(0));
        // 800 frames of device latency push the heard position back 100 ms
        assert_eq!(clock.position_ns(800, 1.0), Some(-100_000_000));

        let mut out = vec![0.0; 1000];
        assert_eq!(clock.read(&mut out), 1000);
        assert_eq!(clock.position_ns(0, 1.0), Some(125_000_000));
    }

    #[test]
    fn speed_scales_pending_media_time() {
        let queue = SafeQueue::new();
        queue.push(block(0, 800, 8000, 1)).unwrap();
        let mut clock = AudioClock::new(&options(8000, 1));
        clock.fill(&queue, 800, false);
        assert_eq!(clock.position_ns(800, 2.0), Some(-300_000_000));
    }

    #[test]
    fn flush_once_source_ends() {
        let queue = SafeQueue::new();
        queue.push(block(0, 100, 8000, 2)).unwrap();
        let mut clock = AudioClock::new(&options(8000, 2));
        clock.fill(&queue, 400, false);
        assert!(!clock.drained());
        clock.fill(&queue, 400, true);
        let mut out = vec![0.0; 800];
        assert_eq!(clock.read(&mut out), 100);
        assert!(clock.drained());

        clock.reset();
        assert!(!clock.drained());
        assert_eq!(clock.position_ns(0, 1.0), None);
    }

    #[test]
    fn input_is_converted_to_the_device_layout() {
        let queue = SafeQueue::new();
        queue.push(block(0, 400, 16_000, 1)).unwrap();
        let mut clock = AudioClock::new(&options(8000, 2));
        clock.fill(&queue, 1, false);
        assert_eq!(clock.buffered(), 200);
        let mut out = vec![0.0; 400];
        assert_eq!(clock.read(&mut out), 200);
        // the first output frame interpolates from silence
        assert!(out[2..].iter().all(|s| (*s - 0.5).abs() < 1e-6));
        // 400 samples at 16 kHz end at 25 ms
        assert_eq!(clock.position_ns(0, 1.0), Some(25_000_000));
    }

    #[test]
    fn remap_mixes() {
        assert_eq!(remap_channels(&[0.2, 0.4], 2, 1), vec![0.3f32]);
        assert_eq!(remap_channels(&[0.1], 1, 3), vec![0.1, 0.1, 0.1]);
        assert_eq!(remap_channels(&[1.0, 2.0, 3.0], 3, 2), vec![1.0, 2.0]);
        assert_eq!(remap_channels(&[1.0, 2.0], 2, 3), vec![1.0, 2.0, 0.0]);
    }
}
