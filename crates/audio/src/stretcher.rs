//! Overlap-add time-stretcher.
//!
//! Changes playback rate without resampling: Hann-windowed grains are taken
//! from the input every `hop * speed` frames and laid down every `hop`
//! frames in the output. A periodic Hann window at 50% overlap sums to one,
//! so a constant signal passes through unchanged in level.
//!
//! At speed 1.0 samples are copied straight through.

use std::collections::VecDeque;

/// Grain length in milliseconds.
const GRAIN_MS: u32 = 40;

/// Streaming stretcher over interleaved `f32` samples.
pub struct TimeStretcher {
    channels: usize,
    speed: f64,
    grain: usize,
    hop: usize,
    window: Vec<f32>,
    /// Unconsumed input, interleaved.
    input: Vec<f32>,
    /// Fractional read position into `input`, in frames.
    in_pos: f64,
    /// Overlap accumulator, `grain` frames long.
    acc: Vec<f32>,
    /// Whether `acc` holds a grain tail.
    acc_live: bool,
    output: VecDeque<f32>,
}

impl TimeStretcher {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let grain = ((sample_rate.max(1) * GRAIN_MS / 1000) as usize).max(4) & !1;
        let window = (0..grain)
            .map(|i| {
                let phase = std::f32::consts::TAU * i as f32 / grain as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();
        Self {
            channels,
            speed: 1.0,
            grain,
            hop: grain / 2,
            window,
            input: Vec::new(),
            in_pos: 0.0,
            acc: vec![0.0; grain * channels],
            acc_live: false,
            output: VecDeque::new(),
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// New playback rate; non-positive or non-finite values are ignored.
    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() && speed > 0.0 {
            self.speed = speed;
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn passthrough(&self) -> bool {
        (self.speed - 1.0).abs() < 1e-6
    }

    /// Feed interleaved samples.
    pub fn write(&mut self, samples: &[f32]) {
        if self.passthrough() {
            self.settle();
            self.output.extend(samples.iter().copied());
            return;
        }
        self.input.extend_from_slice(samples);
        self.process();
    }

    /// Copy stretched frames into `out`. Returns the number of frames
    /// written, which may be fewer than `out` holds.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let frames = (out.len() / self.channels).min(self.output.len() / self.channels);
        let n = frames * self.channels;
        for (dst, src) in out[..n].iter_mut().zip(self.output.drain(..n)) {
            *dst = src;
        }
        frames
    }

    /// Frames still to be heard, measured at the output rate.
    pub fn buffered(&self) -> usize {
        let ready = self.output.len() / self.channels;
        let pending = (self.input.len() / self.channels) as f64 - self.in_pos;
        ready + (pending.max(0.0) / self.speed) as usize
    }

    /// Push every pending input frame through, padding the last grain with
    /// silence. Used at end of stream.
    pub fn flush(&mut self) {
        if self.passthrough() {
            self.settle();
            return;
        }
        let pending = (self.input.len() / self.channels) as f64 - self.in_pos;
        if pending > 0.0 {
            let pad = self.grain * self.channels;
            self.input.extend(std::iter::repeat(0.0).take(pad));
            let end = self.in_pos + pending;
            while self.in_pos < end && self.next_grain() {}
        }
        self.emit_tail();
        self.input.clear();
        self.in_pos = 0.0;
    }

    /// Discard everything, e.g. on seek.
    pub fn clear(&mut self) {
        self.input.clear();
        self.in_pos = 0.0;
        self.acc.fill(0.0);
        self.acc_live = false;
        self.output.clear();
    }

    /// Leave stretching mode: emit the overlap tail and whatever input is
    /// left unstretched.
    fn settle(&mut self) {
        if !self.acc_live && self.input.is_empty() {
            return;
        }
        self.emit_tail();
        let start = (self.in_pos.floor() as usize * self.channels).min(self.input.len());
        self.output.extend(self.input.drain(start..));
        self.input.clear();
        self.in_pos = 0.0;
    }

    fn emit_tail(&mut self) {
        if self.acc_live {
            let n = self.hop * self.channels;
            self.output.extend(self.acc[..n].iter().copied());
            self.acc.fill(0.0);
            self.acc_live = false;
        }
    }

    fn process(&mut self) {
        while self.next_grain() {}
        // drop consumed input
        let consumed = self.in_pos.floor() as usize;
        if consumed > 0 {
            let n = (consumed * self.channels).min(self.input.len());
            self.input.drain(..n);
            self.in_pos -= consumed as f64;
        }
    }

    /// Overlap-add one grain if enough input is available.
    fn next_grain(&mut self) -> bool {
        let ch = self.channels;
        let start = self.in_pos.floor() as usize;
        if (start + self.grain) * ch > self.input.len() {
            return false;
        }
        for (i, w) in self.window.iter().enumerate() {
            let src = (start + i) * ch;
            let dst = i * ch;
            for c in 0..ch {
                self.acc[dst + c] += self.input[src + c] * w;
            }
        }
        self.acc_live = true;

        // the first hop is complete: move it out and shift the rest down
        let n = self.hop * ch;
        self.output.extend(self.acc[..n].iter().copied());
        self.acc.copy_within(n.., 0);
        let len = self.acc.len();
        self.acc[len - n..].fill(0.0);

        self.in_pos += self.hop as f64 * self.speed;
        true
    }
}

impl std::fmt::Debug for TimeStretcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeStretcher")
            .field("channels", &self.channels)
            .field("speed", &self.speed)
            .field("buffered", &self.buffered())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(s: &mut TimeStretcher) -> Vec<f32> {
        let mut out = vec![0.0; 1 << 16];
        let frames = s.read(&mut out);
        out.truncate(frames * s.channels());
        out
    }

    #[test]
    fn unity_speed_passes_through() {
        let mut s = TimeStretcher::new(8000, 2);
        let input: Vec<f32> = (0..200).map(|i| i as f32 / 200.0).collect();
        s.write(&input);
        assert_eq!(s.buffered(), 100);
        assert_eq!(drain(&mut s), input);
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn read_is_bounded_by_output() {
        let mut s = TimeStretcher::new(8000, 1);
        s.write(&[0.25; 10]);
        let mut out = [0.0; 4];
        assert_eq!(s.read(&mut out), 4);
        assert_eq!(out, [0.25; 4]);
        assert_eq!(s.buffered(), 6);
    }

    #[test]
    fn double_speed_halves_length() {
        let mut s = TimeStretcher::new(8000, 1);
        s.set_speed(2.0);
        s.write(&vec![0.5; 8000]);
        s.flush();
        let out = drain(&mut s);
        let expected = 4000;
        assert!(
            (out.len() as i64 - expected).abs() <= 2 * 320,
            "got {} frames",
            out.len()
        );
    }

    #[test]
    fn half_speed_doubles_length_and_keeps_level() {
        let mut s = TimeStretcher::new(8000, 1);
        s.set_speed(0.5);
        s.write(&vec![0.5; 4000]);
        s.flush();
        let out = drain(&mut s);
        assert!((out.len() as i64 - 8000).abs() <= 2 * 320, "got {}", out.len());
        // away from the edges overlapping windows sum to the input level
        let mid = &out[out.len() / 4..out.len() / 2];
        assert!(mid.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn buffered_counts_pending_input() {
        let mut s = TimeStretcher::new(8000, 1);
        s.set_speed(2.0);
        s.write(&[0.0; 100]);
        // not enough for a grain yet: 100 input frames play as 50
        assert_eq!(s.buffered(), 50);
    }

    #[test]
    fn clear_discards_everything() {
        let mut s = TimeStretcher::new(8000, 1);
        s.set_speed(1.5);
        s.write(&vec![0.1; 2000]);
        s.clear();
        assert_eq!(s.buffered(), 0);
        assert!(drain(&mut s).is_empty());
    }

    #[test]
    fn switching_back_to_unity_keeps_samples() {
        let mut s = TimeStretcher::new(8000, 1);
        s.set_speed(2.0);
        s.write(&[0.3; 100]);
        s.set_speed(1.0);
        s.write(&[0.3; 10]);
        // the unstretched remainder comes out ahead of the new samples
        assert_eq!(drain(&mut s).len(), 110);
    }
}
