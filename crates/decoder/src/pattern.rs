//! Synthetic picture and tone generation for the test source.

use capline_common::convert::from_rgba;
use capline_common::{AudioFrame, PixelFormat, VideoFrame};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Audio content of the generator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Noise,
    Silence,
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    (r + m, g + m, b + m)
}

/// Side of one frame-counter block, in pixels.
const COUNTER_BLOCK: usize = 4;

/// Moving-gradient picture. The top row carries the frame index in binary
/// (white block = 1) so frame order can be checked after a round trip.
pub fn test_picture(format: PixelFormat, width: u32, height: u32, index: u64) -> VideoFrame {
    let (w, h) = (width as usize, height as usize);
    let mut rgba = vec![0u8; w * h * 4];
    let phase = index as f32 / 30.0;

    for y in 0..h {
        for x in 0..w {
            let nx = x as f32 / w.max(1) as f32;
            let ny = y as f32 / h.max(1) as f32;
            let hue = (nx * 180.0 + phase * 60.0).rem_euclid(360.0);
            let (r, g, b) = hsv_to_rgb(hue, 0.6, 0.6 + 0.3 * ny);
            let bar = (1.0 - (nx - (phase * 0.2).rem_euclid(1.0)).abs() * 10.0).clamp(0.0, 0.3);
            let o = (y * w + x) * 4;
            rgba[o] = ((r + bar).clamp(0.0, 1.0) * 255.0) as u8;
            rgba[o + 1] = ((g + bar).clamp(0.0, 1.0) * 255.0) as u8;
            rgba[o + 2] = ((b + bar).clamp(0.0, 1.0) * 255.0) as u8;
            rgba[o + 3] = 255;
        }
    }

    for bit in 0..16usize {
        let x0 = bit * COUNTER_BLOCK;
        if x0 + COUNTER_BLOCK > w || COUNTER_BLOCK > h {
            break;
        }
        let value = if index & (1 << bit) != 0 { 255 } else { 0 };
        for y in 0..COUNTER_BLOCK {
            for x in x0..x0 + COUNTER_BLOCK {
                let o = (y * w + x) * 4;
                rgba[o..o + 3].fill(value);
            }
        }
    }

    from_rgba(&rgba, width, height, format)
        .unwrap_or_else(|| VideoFrame::new(PixelFormat::Rgba, width, height))
}

/// Read back the counter written by [`test_picture`] from an RGBA picture.
pub fn read_counter(rgba: &[u8], width: u32) -> u64 {
    let w = width as usize;
    (0..16usize)
        .take_while(|bit| (bit + 1) * COUNTER_BLOCK <= w)
        .filter(|bit| {
            let o = (COUNTER_BLOCK / 2 * w + bit * COUNTER_BLOCK + COUNTER_BLOCK / 2) * 4;
            rgba.get(o).is_some_and(|v| *v > 127)
        })
        .fold(0u64, |acc, bit| acc | (1 << bit))
}

/// Generates interleaved audio blocks with a running phase.
#[derive(Debug)]
pub struct ToneGenerator {
    waveform: Waveform,
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    channels: u16,
}

impl ToneGenerator {
    pub fn new(waveform: Waveform, frequency: f32, sample_rate: u32, channels: u16) -> Self {
        Self {
            waveform,
            frequency,
            amplitude: 0.5,
            sample_rate,
            channels,
        }
    }

    /// `nb_samples` samples per channel starting at absolute sample `start`.
    pub fn block(&self, start: u64, nb_samples: usize, rng: &mut StdRng) -> AudioFrame {
        let ch = self.channels as usize;
        let mut samples = Vec::with_capacity(nb_samples * ch);
        let step = std::f64::consts::TAU * self.frequency as f64 / self.sample_rate.max(1) as f64;
        for i in 0..nb_samples {
            let value = match self.waveform {
                Waveform::Sine => ((start + i as u64) as f64 * step).sin() as f32 * self.amplitude,
                Waveform::Noise => rng.gen_range(-self.amplitude..=self.amplitude),
                Waveform::Silence => 0.0,
            };
            samples.extend(std::iter::repeat(value).take(ch));
        }
        AudioFrame::new(self.sample_rate, self.channels, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::convert::to_rgba;
    use rand::SeedableRng;

    #[test]
    fn counter_survives_rgba() {
        for index in [0u64, 1, 5, 300, 1023] {
            let pic = test_picture(PixelFormat::Rgba, 64, 16, index);
            assert_eq!(read_counter(&pic.planes[0], 64), index);
        }
    }

    #[test]
    fn counter_survives_yuv() {
        let pic = test_picture(PixelFormat::Yuv420p, 64, 16, 42);
        let rgba = to_rgba(&pic).unwrap();
        assert_eq!(read_counter(&rgba, 64), 42);
    }

    #[test]
    fn tiny_pictures_do_not_panic() {
        let pic = test_picture(PixelFormat::Nv12, 2, 2, 7);
        assert_eq!(pic.byte_len(), 6);
    }

    #[test]
    fn sine_is_continuous_across_blocks() {
        let gen = ToneGenerator::new(Waveform::Sine, 1000.0, 48_000, 2);
        let mut rng = StdRng::seed_from_u64(1);
        let whole = gen.block(0, 96, &mut rng);
        let a = gen.block(0, 48, &mut rng);
        let b = gen.block(48, 48, &mut rng);
        let joined: Vec<f32> = a.samples.iter().chain(&b.samples).copied().collect();
        assert_eq!(whole.samples, joined);
        assert_eq!(whole.nb_samples(), 96);
    }

    #[test]
    fn noise_stays_in_range() {
        let gen = ToneGenerator::new(Waveform::Noise, 0.0, 8000, 1);
        let mut rng = StdRng::seed_from_u64(7);
        let block = gen.block(0, 512, &mut rng);
        assert!(block.samples.iter().all(|s| s.abs() <= 0.5));
        assert!(block.samples.iter().any(|s| *s != 0.0));
    }
}
