//! Audio filters. Samples are interleaved `f32` throughout.

use std::collections::VecDeque;

use capline_audio::Resampler;
use capline_common::{rescale, AudioFrame, Frame, MediaError, MediaKind, MediaResult, Rational};

use super::filter::{bad_arg, parse_arg, parse_opt, Filter};
use super::parser::FilterSpec;

fn samples_of<'a>(filter: &str, frame: &'a mut Frame) -> MediaResult<&'a mut AudioFrame> {
    frame
        .as_audio_mut()
        .ok_or_else(|| MediaError::InvalidArgument(format!("{filter}: not an audio frame")))
}

fn sample_time_base(sample_rate: u32) -> Rational {
    Rational::new(1, sample_rate.max(1) as i32)
}

// ── Volume ───────────────────────────────────────────────────────

/// `volume=gain`, linear (`0.5`) or in decibels (`-6dB`).
pub struct Volume {
    gain: f32,
}

impl Volume {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let raw = spec
            .arg(0, "volume")
            .ok_or_else(|| bad_arg("volume", "missing gain"))?;
        let gain = parse_gain(raw).ok_or_else(|| bad_arg("volume", format!("invalid gain '{raw}'")))?;
        Ok(Self { gain })
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

fn parse_gain(raw: &str) -> Option<f32> {
    let lower = raw.trim().to_ascii_lowercase();
    let gain = match lower.strip_suffix("db") {
        Some(db) => 10f32.powf(db.trim().parse::<f32>().ok()? / 20.0),
        None => lower.parse::<f32>().ok()?,
    };
    (gain.is_finite() && gain >= 0.0).then_some(gain)
}

impl Filter for Volume {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let block = samples_of("volume", &mut frame)?;
        for s in &mut block.samples {
            *s *= self.gain;
        }
        out.push(frame);
        Ok(())
    }
}

// ── Mixing ───────────────────────────────────────────────────────

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MixDuration {
    Longest,
    Shortest,
}

/// `amix[=inputs=N[:duration=longest|shortest]]`.
///
/// Each input is scaled by `1/N` and summed. Inputs must share sample rate
/// and channel count. An input that ended contributes silence
/// (`longest`) or ends the mix (`shortest`).
pub struct AMix {
    inputs: usize,
    duration: MixDuration,
    pending: Vec<VecDeque<f32>>,
    ended: Vec<bool>,
    layout: Option<(u32, u16)>,
    next_pts: Option<i64>,
    finished: bool,
}

impl AMix {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let inputs: usize = parse_opt(spec, 0, "inputs")?.unwrap_or(2);
        if inputs == 0 {
            return Err(bad_arg("amix", "needs at least one input"));
        }
        let duration = match spec.arg(1, "duration") {
            None | Some("longest") => MixDuration::Longest,
            Some("shortest") => MixDuration::Shortest,
            Some(other) => return Err(bad_arg("amix", format!("unknown duration '{other}'"))),
        };
        Ok(Self::new(inputs, duration == MixDuration::Shortest))
    }

    pub fn new(inputs: usize, shortest: bool) -> Self {
        Self {
            inputs,
            duration: if shortest {
                MixDuration::Shortest
            } else {
                MixDuration::Longest
            },
            pending: vec![VecDeque::new(); inputs],
            ended: vec![false; inputs],
            layout: None,
            next_pts: None,
            finished: false,
        }
    }

    /// Samples per channel that can be mixed right now.
    fn ready(&self, channels: usize) -> usize {
        let available = |i: usize| self.pending[i].len() / channels;
        let open: Vec<usize> = (0..self.inputs).filter(|i| !self.ended[*i]).collect();
        match self.duration {
            MixDuration::Shortest => (0..self.inputs).map(available).min().unwrap_or(0),
            MixDuration::Longest if open.is_empty() => {
                (0..self.inputs).map(available).max().unwrap_or(0)
            }
            MixDuration::Longest => open.into_iter().map(available).min().unwrap_or(0),
        }
    }

    fn mix(&mut self, out: &mut Vec<Frame>) {
        let Some((sample_rate, channels)) = self.layout else {
            return;
        };
        if self.finished {
            return;
        }
        let ch = channels as usize;
        let count = self.ready(ch);
        if count > 0 {
            let scale = 1.0 / self.inputs as f32;
            let mut mixed = vec![0.0f32; count * ch];
            for queue in &mut self.pending {
                let take = queue.len().min(count * ch);
                for (dst, src) in mixed.iter_mut().zip(queue.drain(..take)) {
                    *dst += src * scale;
                }
            }
            let pts = self.next_pts.unwrap_or(0);
            self.next_pts = Some(pts + count as i64);
            out.push(Frame::audio(
                AudioFrame::new(sample_rate, channels, mixed),
                Some(pts),
                sample_time_base(sample_rate),
            ));
        }
        let shortest_done = self.duration == MixDuration::Shortest && self.ended.iter().any(|e| *e);
        if shortest_done || self.ended.iter().all(|e| *e) {
            self.finished = true;
        }
    }
}

impl Filter for AMix {
    fn name(&self) -> &'static str {
        "amix"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn num_inputs(&self) -> usize {
        self.inputs
    }

    fn filter(&mut self, pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let time_base = frame.time_base;
        let pts = frame.pts;
        let block = samples_of("amix", &mut frame)?;
        let layout = (block.sample_rate, block.channels);
        match self.layout {
            None => {
                self.layout = Some(layout);
                self.next_pts = pts.map(|p| rescale(p, time_base, sample_time_base(layout.0)));
            }
            Some(expected) if expected != layout => {
                return Err(MediaError::InvalidArgument(format!(
                    "amix: input {pad} is {}Hz/{}ch, expected {}Hz/{}ch",
                    layout.0, layout.1, expected.0, expected.1
                )));
            }
            Some(_) => {}
        }
        if self.finished || self.ended[pad] {
            return Ok(());
        }
        self.pending[pad].extend(block.samples.drain(..));
        self.mix(out);
        Ok(())
    }

    fn end(&mut self, pad: usize, out: &mut Vec<Frame>) -> MediaResult<()> {
        if let Some(flag) = self.ended.get_mut(pad) {
            *flag = true;
        }
        self.mix(out);
        Ok(())
    }

    fn is_done(&self, ended: &[bool]) -> bool {
        match self.duration {
            MixDuration::Shortest => ended.iter().any(|e| *e),
            MixDuration::Longest => ended.iter().all(|e| *e),
        }
    }
}

// ── Resampling ───────────────────────────────────────────────────

/// `aresample=rate`, linear interpolation.
pub struct AResample {
    rate: u32,
    resampler: Option<Resampler>,
    next_pts: Option<i64>,
}

impl AResample {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let rate: u32 = parse_arg(spec, 0, "sample_rate")?;
        if rate == 0 {
            return Err(bad_arg("aresample", "rate must be non-zero"));
        }
        Ok(Self::new(rate))
    }

    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            resampler: None,
            next_pts: None,
        }
    }
}

impl Filter for AResample {
    fn name(&self) -> &'static str {
        "aresample"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let time_base = frame.time_base;
        let pts = frame.pts;
        let block = samples_of("aresample", &mut frame)?;
        if block.sample_rate == self.rate {
            out.push(frame);
            return Ok(());
        }
        let rebuild = self.resampler.as_ref().map_or(true, |r| {
            r.from_rate() != block.sample_rate || r.channels() != block.channels
        });
        if rebuild {
            self.resampler = Some(Resampler::new(block.sample_rate, self.rate, block.channels));
            self.next_pts = pts.map(|p| rescale(p, time_base, sample_time_base(self.rate)));
        }
        let channels = block.channels;
        let resampled = match self.resampler.as_mut() {
            Some(r) => r.process(&block.samples),
            None => return Ok(()),
        };
        let out_block = AudioFrame::new(self.rate, channels, resampled);
        let pts = self.next_pts.unwrap_or(0);
        self.next_pts = Some(pts + out_block.nb_samples() as i64);
        out.push(Frame::audio(out_block, Some(pts), sample_time_base(self.rate)));
        Ok(())
    }
}

// ── Channel layout ───────────────────────────────────────────────

/// `aformat=channels=N` (or `channel_layouts=mono|stereo`).
pub struct AFormat {
    channels: u16,
}

impl AFormat {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let channels = match spec.named("channel_layouts").or(spec.named("cl")) {
            Some("mono") => 1,
            Some("stereo") => 2,
            Some(other) => return Err(bad_arg("aformat", format!("unknown layout '{other}'"))),
            None => parse_arg::<u16>(spec, 0, "channels")?,
        };
        if channels == 0 {
            return Err(bad_arg("aformat", "channel count must be non-zero"));
        }
        Ok(Self::new(channels))
    }

    pub fn new(channels: u16) -> Self {
        Self { channels }
    }
}

/// Remap interleaved samples from `from` to `to` channels.
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from as usize, to as usize);
    if from == to || from == 0 {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            out.extend((0..to).map(|c| frame[c % from]));
        }
    }
    out
}

impl Filter for AFormat {
    fn name(&self) -> &'static str {
        "aformat"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let block = samples_of("aformat", &mut frame)?;
        if block.channels != self.channels {
            block.samples = remix(&block.samples, block.channels, self.channels);
            block.channels = self.channels;
        }
        out.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parser::parse_graph;

    fn spec(desc: &str) -> FilterSpec {
        parse_graph(desc).unwrap().remove(0).remove(0)
    }

    fn block(rate: u32, channels: u16, samples: Vec<f32>, pts: i64) -> Frame {
        Frame::audio(
            AudioFrame::new(rate, channels, samples),
            Some(pts),
            Rational::new(1, rate as i32),
        )
    }

    fn samples(frame: &Frame) -> &[f32] {
        &frame.as_audio().unwrap().samples
    }

    #[test]
    fn volume_linear_and_decibels() {
        assert_eq!(Volume::from_spec(&spec("volume=0.5")).unwrap().gain(), 0.5);
        let db = Volume::from_spec(&spec("volume=-6dB")).unwrap().gain();
        assert!((db - 0.501).abs() < 0.01, "{db}");
        assert!(Volume::from_spec(&spec("volume=loud")).is_err());
        assert!(Volume::from_spec(&spec("volume=-1")).is_err());

        let mut vol = Volume::from_spec(&spec("volume=2")).unwrap();
        let mut out = Vec::new();
        vol.filter(0, block(8000, 1, vec![0.25, -0.5], 0), &mut out).unwrap();
        assert_eq!(samples(&out[0]), &[0.5, -1.0]);
    }

    #[test]
    fn amix_waits_for_all_open_inputs() {
        let mut mix = AMix::from_spec(&spec("amix=inputs=2")).unwrap();
        let mut out = Vec::new();
        mix.filter(0, block(8000, 1, vec![1.0; 4], 0), &mut out).unwrap();
        assert!(out.is_empty());
        mix.filter(1, block(8000, 1, vec![0.5; 2], 0), &mut out).unwrap();
        assert_eq!(samples(&out[0]), &[0.75, 0.75]);

        // input 1 ends; the rest of input 0 is mixed against silence
        mix.end(1, &mut out).unwrap();
        assert_eq!(samples(&out[1]), &[0.5, 0.5]);
        assert_eq!(out[1].pts, Some(2));
        assert!(!mix.is_done(&[false, true]));
    }

    #[test]
    fn amix_shortest_stops_at_first_end() {
        let mut mix = AMix::from_spec(&spec("amix=inputs=2:duration=shortest")).unwrap();
        let mut out = Vec::new();
        mix.filter(0, block(8000, 1, vec![1.0; 4], 0), &mut out).unwrap();
        mix.end(1, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(mix.is_done(&[false, true]));
    }

    #[test]
    fn amix_rejects_mismatched_inputs() {
        let mut mix = AMix::new(2, false);
        let mut out = Vec::new();
        mix.filter(0, block(8000, 1, vec![0.0; 4], 0), &mut out).unwrap();
        assert!(mix.filter(1, block(16000, 1, vec![0.0; 4], 0), &mut out).is_err());
    }

    #[test]
    fn aresample_rewrites_rate_and_timestamps() {
        let mut rs = AResample::from_spec(&spec("aresample=16000")).unwrap();
        let mut out = Vec::new();
        rs.filter(0, block(8000, 1, vec![0.0; 80], 80), &mut out).unwrap();
        rs.filter(0, block(8000, 1, vec![0.0; 80], 160), &mut out).unwrap();
        let first = out[0].as_audio().unwrap();
        assert_eq!(first.sample_rate, 16000);
        assert!((first.nb_samples() as i64 - 160).abs() <= 1);
        assert_eq!(out[0].pts, Some(160));
        assert_eq!(out[1].pts, Some(160 + first.nb_samples() as i64));
        assert_eq!(out[0].time_base, Rational::new(1, 16000));
    }

    #[test]
    fn aformat_up_and_down_mix() {
        let mut mono = AFormat::from_spec(&spec("aformat=channel_layouts=mono")).unwrap();
        let mut out = Vec::new();
        mono.filter(0, block(8000, 2, vec![1.0, 0.0, 0.5, 0.5], 0), &mut out).unwrap();
        assert_eq!(samples(&out[0]), &[0.5, 0.5]);

        let mut stereo = AFormat::from_spec(&spec("aformat=channels=2")).unwrap();
        stereo.filter(0, block(8000, 1, vec![0.1, 0.2], 0), &mut out).unwrap();
        assert_eq!(samples(&out[1]), &[0.1, 0.1, 0.2, 0.2]);
        assert!(AFormat::from_spec(&spec("aformat=cl=quad")).is_err());
    }
}
