//! Audio render sinks.
//!
//! A renderer owns the output device and drives playback by *pulling*: on
//! its own cadence it calls the registered [`PullCallback`] with a buffer to
//! fill, the number of frames wanted and the instant at which the first of
//! them will be heard. Whatever the callback does not fill is silence.
//!
//! - [`NullAudioRenderer`]: headless. Pulled manually with
//!   [`pump`](NullAudioRenderer::pump) or by a clock thread.
//! - `CpalAudioRenderer` (feature `cpal-output`): the system output device.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AudioError;

/// `(interleaved buffer, frame count, delivery instant) -> frames written`.
pub type PullCallback = Box<dyn FnMut(&mut [f32], usize, Instant) -> usize + Send>;

/// What the renderer should open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererOptions {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames requested per pull.
    pub period_frames: usize,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            period_frames: 1024,
        }
    }
}

impl RendererOptions {
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 || self.channels == 0 || self.period_frames == 0 {
            return Err(AudioError::InvalidConfig(format!(
                "{} Hz, {} channels, {} frames per period",
                self.sample_rate, self.channels, self.period_frames
            )));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Render device contract used by the player.
pub trait AudioRenderer: Send {
    /// Open `device_id` (`None` = default device).
    fn open(&mut self, device_id: Option<&str>, options: &RendererOptions)
        -> Result<(), AudioError>;

    /// Options actually in effect after `open`.
    fn options(&self) -> Option<RendererOptions>;

    fn set_callback(&mut self, callback: PullCallback);

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Drop anything queued in the device, e.g. after a seek.
    fn reset(&mut self);

    fn volume(&self) -> f32;

    fn set_volume(&mut self, volume: f32);

    fn mute(&self) -> bool;

    fn set_mute(&mut self, mute: bool);

    /// Frames handed to the device but not yet heard.
    fn buffer_size(&self) -> usize;
}

// ── Gain ─────────────────────────────────────────────────────────────

/// Volume and mute shared with the thread that fills buffers.
#[derive(Clone, Debug)]
pub(crate) struct Gain {
    volume_bits: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
}

impl Default for Gain {
    fn default() -> Self {
        Self {
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Gain {
    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Apply to a freshly filled buffer.
    pub(crate) fn apply(&self, buffer: &mut [f32]) {
        if self.muted() {
            buffer.fill(0.0);
            return;
        }
        let volume = self.volume();
        if (volume - 1.0).abs() > f32::EPSILON {
            buffer.iter_mut().for_each(|s| *s *= volume);
        }
    }
}

/// Run the callback for one period and silence what it left unfilled.
pub(crate) fn fill_period(
    callback: &mut PullCallback,
    buffer: &mut [f32],
    channels: usize,
    delivery: Instant,
    gain: &Gain,
) -> usize {
    let frames = buffer.len() / channels.max(1);
    let written = callback(buffer, frames, delivery).min(frames);
    buffer[written * channels..].fill(0.0);
    gain.apply(buffer);
    written
}

// ── Null renderer ────────────────────────────────────────────────────

struct NullShared {
    callback: Mutex<Option<PullCallback>>,
    running: AtomicBool,
    /// Frames delivered by the callback (not counting silence).
    delivered: AtomicU64,
    /// Every buffer handed out, when capturing.
    capture: Mutex<Option<Vec<f32>>>,
}

/// Headless renderer with no device latency.
pub struct NullAudioRenderer {
    options: Option<RendererOptions>,
    shared: Arc<NullShared>,
    gain: Gain,
    clocked: bool,
    clock: Option<thread::JoinHandle<()>>,
}

impl Default for NullAudioRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl NullAudioRenderer {
    /// Renderer that only pulls when [`pump`](Self::pump) is called.
    pub fn new() -> Self {
        Self {
            options: None,
            shared: Arc::new(NullShared {
                callback: Mutex::new(None),
                running: AtomicBool::new(false),
                delivered: AtomicU64::new(0),
                capture: Mutex::new(None),
            }),
            gain: Gain::default(),
            clocked: false,
            clock: None,
        }
    }

    /// Renderer that pulls one period per period length on an
    /// `audio-clock` thread while started.
    pub fn clocked() -> Self {
        let mut renderer = Self::new();
        renderer.clocked = true;
        renderer
    }

    /// Keep a copy of every rendered sample.
    pub fn capture(self) -> Self {
        *self.shared.capture.lock() = Some(Vec::new());
        self
    }

    pub fn captured(&self) -> Vec<f32> {
        self.shared.capture.lock().clone().unwrap_or_default()
    }

    /// Frames the callback has produced so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }

    /// Pull one period now. Returns frames written by the callback, or 0
    /// when stopped.
    pub fn pump(&self) -> usize {
        match &self.options {
            Some(options) => pull_once(&self.shared, options, &self.gain),
            None => 0,
        }
    }
}

fn pull_once(shared: &NullShared, options: &RendererOptions, gain: &Gain) -> usize {
    if !shared.running.load(Ordering::Acquire) {
        return 0;
    }
    let channels = options.channels as usize;
    let mut buffer = vec![0.0f32; options.period_frames * channels];
    let written = {
        let mut callback = shared.callback.lock();
        match callback.as_mut() {
            Some(cb) => fill_period(cb, &mut buffer, channels, Instant::now(), gain),
            None => 0,
        }
    };
    shared.delivered.fetch_add(written as u64, Ordering::AcqRel);
    if let Some(capture) = shared.capture.lock().as_mut() {
        capture.extend_from_slice(&buffer);
    }
    written
}

impl AudioRenderer for NullAudioRenderer {
    fn open(
        &mut self,
        device_id: Option<&str>,
        options: &RendererOptions,
    ) -> Result<(), AudioError> {
        options.validate()?;
        if let Some(id) = device_id.filter(|id| *id != "null") {
            return Err(AudioError::DeviceNotFound(id.to_string()));
        }
        self.options = Some(options.clone());
        debug!(
            sample_rate = options.sample_rate,
            channels = options.channels,
            "Null audio renderer opened"
        );
        Ok(())
    }

    fn options(&self) -> Option<RendererOptions> {
        self.options.clone()
    }

    fn set_callback(&mut self, callback: PullCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    fn start(&mut self) -> Result<(), AudioError> {
        let options = self.options.clone().ok_or(AudioError::NotOpen)?;
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.clocked {
            let shared = Arc::clone(&self.shared);
            let gain = self.gain.clone();
            let handle = thread::Builder::new()
                .name("audio-clock".into())
                .spawn(move || {
                    let period = options.period();
                    let mut next = Instant::now();
                    while shared.running.load(Ordering::Acquire) {
                        pull_once(&shared, &options, &gain);
                        next += period;
                        let now = Instant::now();
                        if next > now {
                            thread::sleep(next - now);
                        } else {
                            next = now;
                        }
                    }
                })?;
            self.clock = Some(handle);
        }
        info!(clocked = self.clocked, "Null audio renderer started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.clock.take() {
            if handle.join().is_err() {
                warn!("Audio clock thread panicked");
            }
        }
        Ok(())
    }

    fn reset(&mut self) {}

    fn volume(&self) -> f32 {
        self.gain.volume()
    }

    fn set_volume(&mut self, volume: f32) {
        self.gain.set_volume(volume);
    }

    fn mute(&self) -> bool {
        self.gain.muted()
    }

    fn set_mute(&mut self, mute: bool) {
        self.gain.set_muted(mute);
    }

    fn buffer_size(&self) -> usize {
        0
    }
}

impl Drop for NullAudioRenderer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> NullAudioRenderer {
        let mut r = NullAudioRenderer::new().capture();
        r.open(
            None,
            &RendererOptions {
                sample_rate: 8000,
                channels: 1,
                period_frames: 4,
            },
        )
        .unwrap();
        r
    }

    #[test]
    fn rejects_bad_options_and_unknown_devices() {
        let mut r = NullAudioRenderer::new();
        let bad = RendererOptions {
            channels: 0,
            ..RendererOptions::default()
        };
        assert!(matches!(r.open(None, &bad), Err(AudioError::InvalidConfig(_))));
        assert!(matches!(
            r.open(Some("hw:3"), &RendererOptions::default()),
            Err(AudioError::DeviceNotFound(_))
        ));
        assert!(matches!(r.start(), Err(AudioError::NotOpen)));
    }

    #[test]
    fn short_fill_is_padded_with_silence() {
        let mut r = opened();
        r.set_callback(Box::new(|buf: &mut [f32], frames: usize, _at: Instant| {
            assert_eq!(frames, 4);
            buf[..2].fill(0.5);
            2
        }));
        assert_eq!(r.pump(), 0, "stopped renderer does not pull");
        r.start().unwrap();
        assert_eq!(r.pump(), 2);
        assert_eq!(r.captured(), vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(r.delivered(), 2);
    }

    #[test]
    fn volume_and_mute_apply() {
        let mut r = opened();
        r.set_callback(Box::new(|buf: &mut [f32], frames: usize, _| {
            buf.fill(1.0);
            frames
        }));
        r.start().unwrap();
        r.set_volume(0.5);
        r.pump();
        r.set_mute(true);
        assert!(r.mute());
        r.pump();
        let out = r.captured();
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(&out[4..], &[0.0; 4]);
    }

    #[test]
    fn volume_is_clamped() {
        let mut r = NullAudioRenderer::new();
        r.set_volume(3.0);
        assert!((r.volume() - 1.0).abs() < f32::EPSILON);
        r.set_volume(-1.0);
        assert_eq!(r.volume(), 0.0);
    }

    #[test]
    fn clocked_renderer_pulls_on_its_own() {
        let mut r = NullAudioRenderer::clocked();
        r.open(
            None,
            &RendererOptions {
                sample_rate: 8000,
                channels: 2,
                period_frames: 80,
            },
        )
        .unwrap();
        r.set_callback(Box::new(|_buf: &mut [f32], frames: usize, _| frames));
        r.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while r.delivered() < 400 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        r.stop().unwrap();
        assert!(r.delivered() >= 400);
    }
}
