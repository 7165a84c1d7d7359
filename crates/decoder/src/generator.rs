//! Test-pattern source: a [`Producer`] that synthesizes video and audio.
//!
//! Stands in for a real decoder in tests and in the CLI. A background
//! thread interleaves video frames and audio blocks in presentation order
//! and pushes them into the frame channel, optionally paced to wall clock.
//!
//! ```text
//!  control thread                      generator thread
//! ┌──────────────┐   Command::Seek   ┌──────────────────┐
//! │ start/seek/  │ ─────────────────▶│ interleave V/A,  │──FrameSender──▶
//! │ stop         │ ◀──── ack ─────── │ pace, send, EOS  │
//! └──────────────┘                   └──────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use capline_common::{
    rescale, Frame, FrameSender, MediaError, MediaKind, MediaResult, PixelFormat, Producer,
    Rational, SendFailure, StreamFormat,
};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pattern::{test_picture, ToneGenerator, Waveform};

/// How long a blocked send waits before re-checking for commands.
const SEND_RETRY: Duration = Duration::from_millis(10);
/// Idle sleep once every stream has ended.
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Upper bound on how long `seek` waits for the thread to acknowledge.
const SEEK_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Generator settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub pixel_format: PixelFormat,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per audio block; cycled when more than one is given.
    pub audio_block_sizes: Vec<usize>,
    pub waveform: Waveform,
    pub tone_hz: f32,
    /// Stream length. `None` never ends.
    pub duration_ms: Option<u64>,
    /// Pace output to wall clock instead of running as fast as the
    /// consumer allows.
    pub realtime: bool,
    /// Behave like a capture device: unseekable, no duration.
    pub live: bool,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: 320,
            height: 240,
            frame_rate: Rational::FPS_30,
            pixel_format: PixelFormat::Rgba,
            sample_rate: 48_000,
            channels: 2,
            audio_block_sizes: vec![1024],
            waveform: Waveform::Sine,
            tone_hz: 440.0,
            duration_ms: Some(2000),
            realtime: false,
            live: false,
            seed: 0x5eed,
        }
    }
}

impl GeneratorConfig {
    fn video_time_base(&self) -> Rational {
        self.frame_rate.checked_invert().unwrap_or(Rational::MICROS)
    }

    fn audio_time_base(&self) -> Rational {
        Rational::new(1, self.sample_rate.max(1) as i32)
    }

    fn total_video_frames(&self) -> Option<u64> {
        self.duration_ms.map(|ms| {
            let num = ms as u128 * self.frame_rate.num.max(0) as u128;
            let den = 1000u128 * self.frame_rate.den.max(1) as u128;
            num.div_ceil(den) as u64
        })
    }

    fn total_audio_samples(&self) -> Option<u64> {
        self.duration_ms.map(|ms| ms * self.sample_rate as u64 / 1000)
    }
}

enum Command {
    Seek { position_us: i64, ack: Sender<()> },
    Stop,
}

struct Shared {
    running: AtomicBool,
    eof: [AtomicBool; 2],
    start_us: AtomicI64,
    sink: Mutex<Option<FrameSender>>,
    cmd_tx: Mutex<Option<Sender<Command>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Synthetic audio/video source.
pub struct GeneratorSource {
    config: GeneratorConfig,
    shared: Arc<Shared>,
}

impl GeneratorSource {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                eof: [AtomicBool::new(false), AtomicBool::new(false)],
                start_us: AtomicI64::new(0),
                sink: Mutex::new(None),
                cmd_tx: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn clear_eof(&self) {
        for flag in &self.shared.eof {
            flag.store(false, Ordering::Release);
        }
    }
}

impl Producer for GeneratorSource {
    fn has(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.config.video,
            MediaKind::Audio => self.config.audio,
        }
    }

    fn format(&self, kind: MediaKind) -> Option<StreamFormat> {
        if !self.has(kind) {
            return None;
        }
        Some(match kind {
            MediaKind::Video => StreamFormat::Video {
                format: self.config.pixel_format,
                width: self.config.width,
                height: self.config.height,
                frame_rate: self.config.frame_rate,
                time_base: self.config.video_time_base(),
            },
            MediaKind::Audio => StreamFormat::Audio {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                time_base: self.config.audio_time_base(),
            },
        })
    }

    fn set_sink(&self, sink: FrameSender) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn start(&self) -> MediaResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(MediaError::AlreadyRunning);
        }
        let sink = self
            .shared
            .sink
            .lock()
            .clone()
            .ok_or_else(|| MediaError::NotReady("generator has no frame sink".into()))?;
        if !self.config.frame_rate.is_valid() || self.config.sample_rate == 0 {
            return Err(MediaError::InvalidArgument(
                "generator needs a positive frame rate and sample rate".into(),
            ));
        }

        self.clear_eof();
        let (cmd_tx, cmd_rx) = channel::unbounded();
        let cfg = self.config.clone();
        let shared = Arc::clone(&self.shared);
        self.shared.running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("generator".into())
            .spawn(move || {
                generator_main(cfg, &shared, cmd_rx, sink);
                shared.running.store(false, Ordering::Release);
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                MediaError::Io(e)
            })?;

        *self.shared.cmd_tx.lock() = Some(cmd_tx);
        *self.shared.handle.lock() = Some(handle);
        info!(
            video = self.config.video,
            audio = self.config.audio,
            live = self.config.live,
            "Generator started"
        );
        Ok(())
    }

    fn stop(&self) {
        if let Some(tx) = self.shared.cmd_tx.lock().take() {
            let _ = tx.send(Command::Stop);
        }
        if let Some(handle) = self.shared.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Generator thread panicked");
            }
            debug!("Generator stopped");
        }
        self.shared.running.store(false, Ordering::Release);
    }

    fn seek(&self, position_us: i64, delta_us: i64) -> MediaResult<()> {
        if self.config.live {
            return Err(MediaError::InvalidArgument("live source cannot seek".into()));
        }
        let max = self.duration_us().unwrap_or(i64::MAX);
        let position_us = position_us.clamp(0, max);
        debug!(position_us, delta_us, "Generator seek");

        self.shared.start_us.store(position_us, Ordering::Release);

        let tx = self.shared.cmd_tx.lock().clone();
        match tx {
            None => self.clear_eof(),
            Some(tx) => {
                let (ack_tx, ack_rx) = channel::bounded(1);
                if tx
                    .send(Command::Seek {
                        position_us,
                        ack: ack_tx,
                    })
                    .is_ok()
                    && ack_rx.recv_timeout(SEEK_ACK_TIMEOUT).is_err()
                {
                    warn!(position_us, "Generator did not acknowledge seek in time");
                }
            }
        }
        Ok(())
    }

    fn eof(&self, kind: MediaKind) -> bool {
        self.shared.eof[kind.index()].load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn is_live(&self) -> bool {
        self.config.live
    }

    fn duration_us(&self) -> Option<i64> {
        if self.config.live {
            None
        } else {
            self.config.duration_ms.map(|ms| ms as i64 * 1000)
        }
    }
}

impl Drop for GeneratorSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Generator thread
// ---------------------------------------------------------------------------

struct Cursor {
    video_index: u64,
    audio_sample: u64,
    block: usize,
    /// Wall-clock instant matching `origin_us` of media time.
    epoch: Instant,
    origin_us: i64,
}

impl Cursor {
    fn at(cfg: &GeneratorConfig, position_us: i64) -> Self {
        let video_index = rescale(position_us, Rational::MICROS, cfg.video_time_base()).max(0);
        let audio_sample = rescale(position_us, Rational::MICROS, cfg.audio_time_base()).max(0);
        Self {
            video_index: video_index as u64,
            audio_sample: audio_sample as u64,
            block: 0,
            epoch: Instant::now(),
            origin_us: position_us,
        }
    }
}

enum Delivery {
    Sent,
    Interrupted(Command),
    Closed,
}

fn deliver(sink: &FrameSender, mut frame: Frame, cmd_rx: &Receiver<Command>) -> Delivery {
    loop {
        match sink.send_timeout(frame, SEND_RETRY) {
            Ok(()) => return Delivery::Sent,
            Err(SendFailure::Full(f)) => {
                frame = f;
                if let Ok(cmd) = cmd_rx.try_recv() {
                    return Delivery::Interrupted(cmd);
                }
            }
            Err(SendFailure::Disconnected) => return Delivery::Closed,
        }
    }
}

/// Returns `false` when the thread should exit.
fn apply(cmd: Command, cfg: &GeneratorConfig, cursor: &mut Cursor, shared: &Shared) -> bool {
    match cmd {
        Command::Seek { position_us, ack } => {
            *cursor = Cursor::at(cfg, position_us);
            for flag in &shared.eof {
                flag.store(false, Ordering::Release);
            }
            let _ = ack.send(());
            true
        }
        Command::Stop => false,
    }
}

fn generator_main(
    cfg: GeneratorConfig,
    shared: &Shared,
    cmd_rx: Receiver<Command>,
    sink: FrameSender,
) {
    let mut cursor = Cursor::at(&cfg, shared.start_us.load(Ordering::Acquire));
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let tone = ToneGenerator::new(cfg.waveform, cfg.tone_hz, cfg.sample_rate, cfg.channels);
    let (vtb, atb) = (cfg.video_time_base(), cfg.audio_time_base());
    let total_video = if cfg.live { None } else { cfg.total_video_frames() };
    let total_audio = if cfg.live { None } else { cfg.total_audio_samples() };
    let block_sizes: Vec<usize> = cfg
        .audio_block_sizes
        .iter()
        .copied()
        .filter(|n| *n > 0)
        .collect();
    let block_sizes = if block_sizes.is_empty() {
        vec![1024]
    } else {
        block_sizes
    };

    loop {
        match cmd_rx.try_recv() {
            Ok(cmd) => {
                if !apply(cmd, &cfg, &mut cursor, shared) {
                    return;
                }
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        let video_eof = &shared.eof[MediaKind::Video.index()];
        let audio_eof = &shared.eof[MediaKind::Audio.index()];

        if cfg.video && !video_eof.load(Ordering::Acquire)
            && total_video.is_some_and(|n| cursor.video_index >= n)
        {
            video_eof.store(true, Ordering::Release);
            if sink.send_eos(MediaKind::Video).is_err() {
                return;
            }
            debug!(frames = cursor.video_index, "Generator video EOS");
        }
        if cfg.audio && !audio_eof.load(Ordering::Acquire)
            && total_audio.is_some_and(|n| cursor.audio_sample >= n)
        {
            audio_eof.store(true, Ordering::Release);
            if sink.send_eos(MediaKind::Audio).is_err() {
                return;
            }
            debug!(samples = cursor.audio_sample, "Generator audio EOS");
        }

        let video_left = cfg.video && !video_eof.load(Ordering::Acquire);
        let audio_left = cfg.audio && !audio_eof.load(Ordering::Acquire);
        if !video_left && !audio_left {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let video_us = rescale(cursor.video_index as i64, vtb, Rational::MICROS);
        let audio_us = rescale(cursor.audio_sample as i64, atb, Rational::MICROS);
        let kind = if video_left && (!audio_left || video_us <= audio_us) {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        let due_us = match kind {
            MediaKind::Video => video_us,
            MediaKind::Audio => audio_us,
        };

        if cfg.realtime {
            let offset = Duration::from_micros((due_us - cursor.origin_us).max(0) as u64);
            let due = cursor.epoch + offset;
            let now = Instant::now();
            if due > now {
                thread::sleep((due - now).min(IDLE_SLEEP));
                continue;
            }
        }

        let (frame, advance) = match kind {
            MediaKind::Video => {
                let picture =
                    test_picture(cfg.pixel_format, cfg.width, cfg.height, cursor.video_index);
                let frame = Frame::video(picture, Some(cursor.video_index as i64), vtb)
                    .with_duration(1);
                (frame, 1u64)
            }
            MediaKind::Audio => {
                let mut n = block_sizes[cursor.block % block_sizes.len()] as u64;
                if let Some(total) = total_audio {
                    n = n.min(total.saturating_sub(cursor.audio_sample));
                }
                let block = tone.block(cursor.audio_sample, n as usize, &mut rng);
                (Frame::audio(block, Some(cursor.audio_sample as i64), atb), n)
            }
        };

        match deliver(&sink, frame, &cmd_rx) {
            Delivery::Sent => match kind {
                MediaKind::Video => cursor.video_index += advance,
                MediaKind::Audio => {
                    cursor.audio_sample += advance;
                    cursor.block += 1;
                }
            },
            Delivery::Interrupted(cmd) => {
                if !apply(cmd, &cfg, &mut cursor, shared) {
                    return;
                }
            }
            Delivery::Closed => {
                debug!("Generator sink closed");
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::{frame_channel, FrameEvent, Recv};

    fn short_config() -> GeneratorConfig {
        GeneratorConfig {
            width: 16,
            height: 8,
            frame_rate: Rational::new(10, 1),
            sample_rate: 8000,
            channels: 1,
            audio_block_sizes: vec![400],
            duration_ms: Some(500),
            ..Default::default()
        }
    }

    fn collect(rx: &capline_common::FrameReceiver) -> (Vec<Frame>, Vec<MediaKind>) {
        let mut frames = Vec::new();
        let mut eos = Vec::new();
        while eos.len() < 2 {
            match rx.recv_timeout(Duration::from_secs(2)) {
                Recv::Event(FrameEvent::Frame(f)) => frames.push(f),
                Recv::Event(FrameEvent::Eos(k)) => eos.push(k),
                Recv::Empty | Recv::Disconnected => break,
            }
        }
        (frames, eos)
    }

    #[test]
    fn produces_interleaved_streams_then_eos() {
        let src = GeneratorSource::new(short_config());
        let (tx, rx) = frame_channel(4);
        src.set_sink(tx);
        src.start().unwrap();

        let (frames, eos) = collect(&rx);
        assert_eq!(eos.len(), 2);
        let video: Vec<_> = frames.iter().filter(|f| f.kind() == MediaKind::Video).collect();
        let audio: Vec<_> = frames.iter().filter(|f| f.kind() == MediaKind::Audio).collect();
        assert_eq!(video.len(), 5);
        assert_eq!(audio.iter().map(|f| f.nb_samples()).sum::<usize>(), 4000);

        // presentation order across kinds
        let times: Vec<i64> = frames
            .iter()
            .map(|f| rescale(f.pts.unwrap(), f.time_base, Rational::MICROS))
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));

        assert!(src.eof(MediaKind::Video) && src.eof(MediaKind::Audio));
        assert!(src.eof_all());
        src.stop();
        assert!(!src.is_running());
    }

    #[test]
    fn start_requires_sink_and_rejects_double_start() {
        let src = GeneratorSource::new(short_config());
        assert!(matches!(src.start(), Err(MediaError::NotReady(_))));
        let (tx, _rx) = frame_channel(1);
        src.set_sink(tx);
        src.start().unwrap();
        assert!(matches!(src.start(), Err(MediaError::AlreadyRunning)));
        src.stop();
    }

    #[test]
    fn seek_restarts_from_position() {
        let src = GeneratorSource::new(short_config());
        let (tx, rx) = frame_channel(64);
        src.set_sink(tx);
        src.start().unwrap();
        let _ = collect(&rx);

        src.seek(300_000, 0).unwrap();
        assert!(!src.eof(MediaKind::Video));
        let (frames, eos) = collect(&rx);
        assert_eq!(eos.len(), 2);
        let first_video = frames.iter().find(|f| f.kind() == MediaKind::Video).unwrap();
        assert_eq!(first_video.pts, Some(3));
        src.stop();
    }

    #[test]
    fn zero_frame_rate_is_refused_at_start() {
        let src = GeneratorSource::new(GeneratorConfig {
            frame_rate: Rational::new(0, 1),
            ..short_config()
        });
        assert!(src.format(MediaKind::Video).is_some());
        let (tx, _rx) = frame_channel(4);
        src.set_sink(tx);
        assert!(matches!(src.start(), Err(MediaError::InvalidArgument(_))));
    }

    #[test]
    fn live_source_refuses_seek() {
        let src = GeneratorSource::new(GeneratorConfig {
            live: true,
            ..short_config()
        });
        assert!(src.is_live());
        assert_eq!(src.duration_us(), None);
        assert!(matches!(
            src.seek(0, 0),
            Err(MediaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn audio_only_source() {
        let src = GeneratorSource::new(GeneratorConfig {
            video: false,
            ..short_config()
        });
        assert!(!src.has(MediaKind::Video));
        assert!(src.format(MediaKind::Video).is_none());
        let fmt = src.format(MediaKind::Audio).unwrap();
        assert_eq!(fmt.time_base(), Rational::new(1, 8000));
    }

    #[test]
    fn config_from_json() {
        let cfg: GeneratorConfig =
            serde_json::from_str(r#"{"waveform":"noise","duration_ms":null}"#).unwrap();
        assert_eq!(cfg.waveform, Waveform::Noise);
        assert_eq!(cfg.duration_ms, None);
        assert_eq!(cfg.width, 320);
    }
}
