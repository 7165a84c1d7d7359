//! Streaming sample rate conversion by linear interpolation.
//!
//! Each call sees the previous call's last frame in front of the new block,
//! so a stream converted block by block has no seams. Before the first
//! block that frame is silence.

/// Linear interpolation resampler for interleaved multi-channel audio.
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    channels: u16,
    /// Input frames advanced per output frame.
    step: f64,
    /// Position of the next output frame, in input frames, counted from the
    /// carried frame (0.0 is the carried frame itself).
    phase: f64,
    carry: Vec<f32>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            src_rate: from_rate,
            dst_rate: to_rate,
            channels,
            step,
            phase: 0.0,
            carry: vec![0.0; channels as usize],
        }
    }

    /// Convert one interleaved block.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let width = self.channels as usize;
        if width == 0 {
            return Vec::new();
        }
        if self.src_rate == self.dst_rate {
            return input.to_vec();
        }
        let frames = input.len() / width;
        if frames == 0 {
            return Vec::new();
        }

        // frame i of the block is position i + 1; position 0 is the carry
        let at = |pos: usize, c: usize| match pos {
            0 => self.carry[c],
            p => input[(p - 1) * width + c],
        };
        let estimate = (frames as f64 / self.step).ceil() as usize + 1;
        let mut out = Vec::with_capacity(estimate * width);
        let mut phase = self.phase;
        while phase < frames as f64 {
            let left = phase.floor() as usize;
            let t = (phase - left as f64) as f32;
            for c in 0..width {
                let (a, b) = (at(left, c), at(left + 1, c));
                out.push(a + (b - a) * t);
            }
            phase += self.step;
        }

        self.phase = phase - frames as f64;
        self.carry
            .copy_from_slice(&input[(frames - 1) * width..frames * width]);
        out
    }

    /// Back to the initial state, as after a seek.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.carry.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Output frames per input frame.
    pub fn ratio(&self) -> f64 {
        1.0 / self.step
    }

    pub fn from_rate(&self) -> u32 {
        self.src_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.dst_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resampler({} -> {} Hz, {} ch)",
            self.src_rate, self.dst_rate, self.channels
        )
    }
}
