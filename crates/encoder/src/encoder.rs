//! The encoder consumer.
//!
//! ```text
//!  consume(video) ─▶ RingBuffer(8)  ─┐
//!                                    ├─ encoder-worker ─▶ Matroska file
//!  consume(audio) ─▶ RingBuffer(32) ─┘      │
//!                                     AudioFifo (frame_size blocks)
//! ```
//!
//! `open` validates codecs and creates the container synchronously. The
//! worker started by `run` owns the container and the codec state; the
//! handle talks to it only through the ring buffers and a few atomics.
//! A failure while encoding closes that media kind early and leaves the
//! other one running.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capline_common::{
    option_or, rescale, to_micros, Consumer, DeviceType, EncoderConfig, Frame, MediaError,
    MediaKind, MediaResult, Options, PixelFormat, Rational, RingBuffer, Role, StreamFormat,
};
use capline_gpu_hal::{DeviceRegistry, EncoderHwState};
use capline_mux::{AudioTrackConfig, FileMuxer, MuxStats, MuxerConfig, VideoTrackConfig};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::codec::{AudioEncoder, VideoEncoder};
use crate::eof::{EofState, EOF_AUDIO, EOF_AUDIO_FIFO, EOF_VIDEO};
use crate::error::EncodeError;
use crate::fifo::AudioFifo;
use crate::stats::{Counters, EncoderStats};

/// Worker back-off when both rings are empty.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const DEFAULT_FRAME_RATE: Rational = Rational::FPS_30;
const DEFAULT_FRAME_SIZE: usize = 1024;
const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_MAX_REPEAT: u32 = 60;

fn eof_bits(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Video => EOF_VIDEO,
        MediaKind::Audio => EOF_AUDIO | EOF_AUDIO_FIFO,
    }
}

// ── Open-time settings ───────────────────────────────────────────────

/// Video stream settings parsed from the options map.
#[derive(Clone, Debug)]
struct VideoSettings {
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_rate: Rational,
    max_repeat: u32,
    stall_timeout: Duration,
}

impl VideoSettings {
    fn parse(options: &Options, codec: &str) -> MediaResult<Self> {
        let frame_rate = match options.get("framerate") {
            None => DEFAULT_FRAME_RATE,
            Some(raw) => Rational::parse(raw)
                .filter(|r| r.is_valid())
                .ok_or_else(|| MediaError::codec_open(codec, format!("invalid framerate '{raw}'")))?,
        };
        let format = match options.get("pix_fmt") {
            None => PixelFormat::Rgba,
            Some(raw) => PixelFormat::from_name(raw)
                .ok_or_else(|| MediaError::codec_open(codec, format!("unknown pix_fmt '{raw}'")))?,
        };
        let interval_ms = 1000.0 / frame_rate.as_f64();
        let default_stall = (2.0 * interval_ms).ceil() as u64;
        Ok(Self {
            format,
            width: option_or(options, "width", 0u32)?,
            height: option_or(options, "height", 0u32)?,
            frame_rate,
            max_repeat: option_or(options, "max_repeat", DEFAULT_MAX_REPEAT)?,
            stall_timeout: Duration::from_millis(option_or(options, "stall_timeout_ms", default_stall)?),
        })
    }
}

/// Everything `open` prepared for the worker.
struct Session {
    path: PathBuf,
    muxer: FileMuxer,
    video: Option<VideoPath>,
    audio: Option<AudioPath>,
}

// ── Shared state ─────────────────────────────────────────────────────

struct Shared {
    rings: [RingBuffer<Frame>; 2],
    /// A codec was opened for the kind.
    opened: [AtomicBool; 2],
    enabled: [AtomicBool; 2],
    /// The kind hit an encode error and was closed early.
    failed: [AtomicBool; 2],
    /// `notify_eos` received.
    eos: [AtomicBool; 2],
    eof: EofState,
    running: AtomicBool,
    paused: AtomicBool,
    formats: Mutex<[Option<StreamFormat>; 2]>,
    hw: Mutex<EncoderHwState>,
    counters: Counters,
    mux_stats: Mutex<Option<MuxStats>>,
}

impl Shared {
    fn new(config: &EncoderConfig) -> Self {
        Self {
            rings: [
                RingBuffer::new(config.video_buffer.max(1)),
                RingBuffer::new(config.audio_buffer.max(1)),
            ],
            opened: [AtomicBool::new(false), AtomicBool::new(false)],
            enabled: [AtomicBool::new(true), AtomicBool::new(true)],
            failed: [AtomicBool::new(false), AtomicBool::new(false)],
            eos: [AtomicBool::new(false), AtomicBool::new(false)],
            eof: EofState::new(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            formats: Mutex::new([None, None]),
            hw: Mutex::new(EncoderHwState::default()),
            counters: Counters::default(),
            mux_stats: Mutex::new(None),
        }
    }

    fn ring(&self, kind: MediaKind) -> &RingBuffer<Frame> {
        &self.rings[kind.index()]
    }

    fn flag(flags: &[AtomicBool; 2], kind: MediaKind) -> bool {
        flags[kind.index()].load(Ordering::Acquire)
    }
}

// ── Encoder ──────────────────────────────────────────────────────────

/// Consumer that encodes into a container file.
///
/// # Usage
///
/// ```ignore
/// let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
/// encoder.open("out.mkv", Some("rawvideo"), Some("pcm_s16le"), true, &options)?;
/// dispatcher.set_consumer(encoder.clone())?;
/// dispatcher.start()?;   // calls encoder.run()
/// encoder.wait();        // returns once every path reached end of stream
/// ```
pub struct Encoder {
    config: EncoderConfig,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    hardware: Mutex<Option<(Arc<DeviceRegistry>, DeviceType)>>,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(&config)),
            config,
            session: Mutex::new(None),
            worker: Mutex::new(None),
            hardware: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Read device surfaces through `registry`. The encoder binds itself
    /// to the device's frames context when the first surface arrives.
    pub fn set_hardware(&self, registry: Arc<DeviceRegistry>, device: DeviceType) {
        *self.hardware.lock() = Some((registry, device));
    }

    /// Device and frames context the encoder is bound to, if any.
    pub fn hw_state(&self) -> EncoderHwState {
        self.shared.hw.lock().clone()
    }

    /// [`open`](Self::open) with the codecs and options of the config.
    pub fn open_configured(&self, destination: impl AsRef<Path>) -> MediaResult<()> {
        let config = self.config.clone();
        self.open(
            destination,
            config.video_codec.as_deref(),
            config.audio_codec.as_deref(),
            config.constant_frame_rate,
            &config.options,
        )
    }

    /// Open both codecs (for the kinds given a codec) and the container.
    ///
    /// Video needs `width` and `height` options. Unknown codecs fail with
    /// `CodecOpen`; a destination without a known container extension or
    /// one that cannot be created fails with `MuxerOpen`.
    pub fn open(
        &self,
        destination: impl AsRef<Path>,
        video_codec: Option<&str>,
        audio_codec: Option<&str>,
        constant_frame_rate: bool,
        options: &Options,
    ) -> MediaResult<()> {
        let path = destination.as_ref();
        if self.worker.lock().is_some() {
            return Err(MediaError::AlreadyRunning);
        }
        if video_codec.is_none() && audio_codec.is_none() {
            return Err(MediaError::InvalidArgument("no video or audio codec given".into()));
        }

        let video = match video_codec {
            Some(name) => {
                let settings = VideoSettings::parse(options, name)?;
                let encoder =
                    VideoEncoder::open(name, settings.format, settings.width, settings.height)?;
                Some((encoder, settings))
            }
            None => None,
        };
        let audio = match audio_codec {
            Some(name) => Some(AudioEncoder::open(
                name,
                option_or(options, "sample_rate", DEFAULT_SAMPLE_RATE)?,
                option_or(options, "channels", DEFAULT_CHANNELS)?,
                option_or(options, "frame_size", DEFAULT_FRAME_SIZE)?,
            )?),
            None => None,
        };

        let mux_config = MuxerConfig {
            output_path: path.to_path_buf(),
            title: options.get("title").cloned(),
        };
        let mut muxer = FileMuxer::create(&mux_config).map_err(|e| e.into_open_error(path))?;

        let tracks = add_tracks(&mut muxer, video.as_ref(), audio.as_ref(), constant_frame_rate);
        let (video_track, audio_track) = match tracks {
            Ok(tracks) => tracks,
            Err(e) => {
                drop(muxer);
                if let Err(rm) = std::fs::remove_file(path) {
                    debug!(error = %rm, "Could not remove partial output");
                }
                return Err(e.into_open_error(path));
            }
        };

        let mut formats = [None, None];
        let video = video.zip(video_track).map(|((encoder, settings), track)| {
            let time_base = if constant_frame_rate {
                settings.frame_rate.invert()
            } else {
                Rational::MILLIS
            };
            formats[0] = Some(StreamFormat::Video {
                format: encoder.format(),
                width: settings.width,
                height: settings.height,
                frame_rate: settings.frame_rate,
                time_base,
            });
            info!(
                codec = encoder.codec().name(),
                width = settings.width,
                height = settings.height,
                pix_fmt = encoder.format().name(),
                fps = %settings.frame_rate,
                cfr = constant_frame_rate,
                "Video encoder opened"
            );
            VideoPath::new(encoder, track, time_base, constant_frame_rate, &settings)
        });
        let audio = audio.zip(audio_track).map(|(encoder, track)| {
            formats[1] = Some(StreamFormat::Audio {
                sample_rate: encoder.sample_rate(),
                channels: encoder.channels(),
                time_base: Rational::new(1, encoder.sample_rate() as i32),
            });
            info!(
                codec = encoder.codec().name(),
                sample_rate = encoder.sample_rate(),
                channels = encoder.channels(),
                frame_size = encoder.frame_size(),
                "Audio encoder opened"
            );
            AudioPath::new(encoder, track)
        });

        let shared = &self.shared;
        shared.eof.clear();
        for kind in MediaKind::ALL {
            let idx = kind.index();
            let opened = formats[idx].is_some();
            shared.opened[idx].store(opened, Ordering::Release);
            shared.failed[idx].store(false, Ordering::Release);
            shared.eos[idx].store(false, Ordering::Release);
            shared.rings[idx].clear();
            if !opened {
                shared.eof.set(eof_bits(kind));
            }
        }
        *shared.formats.lock() = formats;
        *shared.mux_stats.lock() = None;

        *self.session.lock() = Some(Session {
            path: path.to_path_buf(),
            muxer,
            video,
            audio,
        });
        info!(path = %path.display(), "Encoder output opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.session.lock().is_some() || self.ready()
    }

    pub fn stats(&self) -> EncoderStats {
        self.shared.counters.snapshot()
    }

    /// Container statistics, available once the trailer was written.
    pub fn mux_stats(&self) -> Option<MuxStats> {
        self.shared.mux_stats.lock().clone()
    }

    /// Raw EOF bits, see [`crate::eof`].
    pub fn eof_bits(&self) -> u8 {
        self.shared.eof.bits()
    }

    /// Whether `kind` was closed early by an encode error.
    pub fn failed(&self, kind: MediaKind) -> bool {
        Shared::flag(&self.shared.failed, kind)
    }
}

fn add_tracks(
    muxer: &mut FileMuxer,
    video: Option<&(VideoEncoder, VideoSettings)>,
    audio: Option<&AudioEncoder>,
    constant_frame_rate: bool,
) -> Result<(Option<u64>, Option<u64>), capline_mux::MuxError> {
    let video_track = match video {
        Some((encoder, settings)) => Some(muxer.add_video_track(VideoTrackConfig {
            codec: encoder.codec(),
            width: settings.width,
            height: settings.height,
            pixel_format: encoder.format(),
            frame_rate: constant_frame_rate.then_some(settings.frame_rate),
        })?),
        None => None,
    };
    let audio_track = match audio {
        Some(encoder) => Some(muxer.add_audio_track(AudioTrackConfig {
            codec: encoder.codec(),
            sample_rate: encoder.sample_rate(),
            channels: encoder.channels(),
        })?),
        None => None,
    };
    Ok((video_track, audio_track))
}

impl Consumer for Encoder {
    fn role(&self) -> Role {
        Role::Encoder
    }

    fn run(&self) -> MediaResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(MediaError::AlreadyRunning);
        }
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(|| MediaError::NotReady("encoder is not open".into()))?;

        let shared = Arc::clone(&self.shared);
        for kind in MediaKind::ALL {
            shared.ring(kind).start();
            if !Shared::flag(&shared.enabled, kind) {
                shared.eos[kind.index()].store(true, Ordering::Release);
            }
        }
        shared.paused.store(false, Ordering::Release);
        shared.running.store(true, Ordering::Release);

        let state = Worker {
            shared: Arc::clone(&shared),
            session: Some(session),
            hardware: self.hardware.lock().clone(),
            audio_end_us: 0,
        };
        let handle = thread::Builder::new()
            .name("encoder-worker".to_string())
            .spawn(move || state.run());
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn consume(&self, frame: Frame, kind: MediaKind) -> bool {
        if frame.kind() != kind || !self.accepts(kind) {
            self.shared.counters.drop_frame(kind);
            return false;
        }
        match self.shared.ring(kind).try_push(frame) {
            Ok(()) => true,
            Err(_) => {
                trace!(kind = %kind, "Encoder buffer full, frame dropped");
                self.shared.counters.drop_frame(kind);
                false
            }
        }
    }

    fn full(&self, kind: MediaKind) -> bool {
        self.shared.ring(kind).is_full()
    }

    fn accepts(&self, kind: MediaKind) -> bool {
        let s = &self.shared;
        Shared::flag(&s.opened, kind)
            && Shared::flag(&s.enabled, kind)
            && !Shared::flag(&s.failed, kind)
            && !Shared::flag(&s.eos, kind)
    }

    /// Disabling a kind while running ends it: buffered frames are still
    /// written, later ones are rejected.
    fn enable(&self, kind: MediaKind, enabled: bool) {
        self.shared.enabled[kind.index()].store(enabled, Ordering::Release);
        if !enabled && self.shared.running.load(Ordering::Acquire) {
            self.notify_eos(kind);
        }
        debug!(kind = %kind, enabled, "Encoder input toggled");
    }

    fn format(&self, kind: MediaKind) -> Option<StreamFormat> {
        self.shared.formats.lock()[kind.index()].clone()
    }

    fn notify_eos(&self, kind: MediaKind) {
        if !self.shared.eos[kind.index()].swap(true, Ordering::AcqRel) {
            debug!(kind = %kind, "Encoder: end of stream announced");
        }
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        for ring in &self.shared.rings {
            ring.stop();
        }
        self.wait();
        // Opened but never run: still leave a valid file behind.
        if let Some(session) = self.session.lock().take() {
            finalize(&self.shared, session);
        }
    }

    fn eof(&self) -> bool {
        self.shared.eof.is_complete()
    }

    fn ready(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn wait(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Encoder worker panicked");
            }
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("video_codec", &self.config.video_codec)
            .field("audio_codec", &self.config.audio_codec)
            .field("running", &self.ready())
            .field("eof_bits", &self.shared.eof.bits())
            .field("stats", &self.stats())
            .finish()
    }
}

// ── Per-kind paths ───────────────────────────────────────────────────

struct VideoPath {
    encoder: VideoEncoder,
    track: u64,
    /// Stream time base. Under CFR one tick is one frame interval.
    time_base: Rational,
    cfr: bool,
    /// Timestamp the next picture should carry.
    expected_pts: Option<i64>,
    /// Last written packet, re-emitted to fill gaps.
    last_packet: Option<Vec<u8>>,
    last_arrival: Instant,
    max_repeat: u32,
    stall_timeout: Duration,
    /// Synthetic pictures written since the last real one.
    stall_repeats: u32,
}

impl VideoPath {
    fn new(
        encoder: VideoEncoder,
        track: u64,
        time_base: Rational,
        cfr: bool,
        settings: &VideoSettings,
    ) -> Self {
        Self {
            encoder,
            track,
            time_base,
            cfr,
            expected_pts: None,
            last_packet: None,
            last_arrival: Instant::now(),
            max_repeat: settings.max_repeat,
            stall_timeout: settings.stall_timeout,
            stall_repeats: 0,
        }
    }
}

struct AudioPath {
    encoder: AudioEncoder,
    track: u64,
    fifo: AudioFifo,
    time_base: Rational,
}

impl AudioPath {
    fn new(encoder: AudioEncoder, track: u64) -> Self {
        Self {
            fifo: AudioFifo::new(encoder.channels()),
            time_base: Rational::new(1, encoder.sample_rate() as i32),
            encoder,
            track,
        }
    }
}

// ── Worker thread ────────────────────────────────────────────────────

struct Worker {
    shared: Arc<Shared>,
    session: Option<Session>,
    hardware: Option<(Arc<DeviceRegistry>, DeviceType)>,
    /// End of the audio written so far, for stall detection.
    audio_end_us: i64,
}

impl Worker {
    fn run(mut self) {
        info!("Encoder worker started");
        let mut was_paused = false;
        while self.shared.running.load(Ordering::Acquire) {
            let paused = self.shared.paused.load(Ordering::Acquire);
            if was_paused && !paused {
                if let Some(video) = self.session.as_mut().and_then(|s| s.video.as_mut()) {
                    video.last_arrival = Instant::now();
                }
            }
            was_paused = paused;

            let mut progressed = self.step_audio();
            progressed |= self.step_video(paused);
            if self.shared.eof.is_complete() {
                info!("Encoder: all streams drained");
                break;
            }
            if !progressed {
                thread::sleep(POLL_INTERVAL);
            }
        }
        if let Some(session) = self.session.take() {
            self.close_audio_on_exit(session);
        }
        self.shared.running.store(false, Ordering::Release);
        debug!("Encoder worker exiting");
    }

    /// Flush the FIFO tail when stopped early, then write the trailer.
    fn close_audio_on_exit(&mut self, mut session: Session) {
        if let Some(audio) = session.audio.as_mut() {
            if !self.shared.eof.is_set(EOF_AUDIO_FIFO) {
                if let Err(e) = write_audio_tail(&self.shared, &mut session.muxer, audio) {
                    warn!(error = %e, kind = ?MediaKind::Audio, "Dropping buffered audio tail");
                }
            }
        }
        finalize(&self.shared, session);
    }

    fn fail(&mut self, kind: MediaKind, err: EncodeError) {
        let err = err.into_media(kind);
        warn!(error = %err, kind = ?kind, "Encode failed, closing this stream");
        let idx = kind.index();
        self.shared.failed[idx].store(true, Ordering::Release);
        self.shared.rings[idx].clear();
        if let Some(session) = self.session.as_mut() {
            match kind {
                MediaKind::Video => session.video = None,
                MediaKind::Audio => session.audio = None,
            }
        }
        self.shared.eof.set(eof_bits(kind));
    }

    // ── Audio ────────────────────────────────────────────────────────

    fn step_audio(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(audio) = session.audio.as_mut() else {
            return false;
        };
        if shared.eof.is_set(EOF_AUDIO | EOF_AUDIO_FIFO) {
            return false;
        }

        let ended = Shared::flag(&shared.eos, MediaKind::Audio);
        let result = match shared.ring(MediaKind::Audio).try_pop() {
            Some(frame) => encode_audio(&shared, &mut session.muxer, audio, frame),
            None if ended => {
                shared.eof.set(EOF_AUDIO);
                debug!("Encoder: audio input drained");
                let tail = write_audio_tail(&shared, &mut session.muxer, audio);
                if tail.is_ok() {
                    shared.eof.set(EOF_AUDIO_FIFO);
                    debug!("Encoder: audio FIFO drained");
                }
                tail
            }
            None => return false,
        };
        if let Some(end) = audio.fifo.end_pts() {
            self.audio_end_us = to_micros(end, audio.time_base);
        }
        if let Err(e) = result {
            self.fail(MediaKind::Audio, e);
        }
        true
    }

    // ── Video ────────────────────────────────────────────────────────

    fn step_video(&mut self, paused: bool) -> bool {
        if self.shared.eof.is_set(EOF_VIDEO) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let ended = Shared::flag(&shared.eos, MediaKind::Video);
        match shared.ring(MediaKind::Video).try_pop() {
            Some(frame) => {
                if let Err(e) = self.encode_video(frame) {
                    self.fail(MediaKind::Video, e);
                }
                true
            }
            None if ended => {
                shared.eof.set(EOF_VIDEO);
                debug!("Encoder: video input drained");
                true
            }
            None if paused => false,
            None => match self.repeat_on_stall() {
                Ok(repeated) => repeated,
                Err(e) => {
                    self.fail(MediaKind::Video, e);
                    true
                }
            },
        }
    }

    fn encode_video(&mut self, mut frame: Frame) -> Result<(), EncodeError> {
        let pic = frame
            .as_video()
            .ok_or_else(|| EncodeError::mismatch("audio block on the video path"))?;
        if pic.format.is_hardware() && !self.shared.hw.lock().is_configured() {
            self.bind_hardware()?;
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(video) = session.video.as_mut() else {
            return Ok(());
        };
        if frame.time_base != video.time_base {
            frame.rescale_to(video.time_base);
        }
        let Some(pic) = frame.as_video() else {
            return Ok(());
        };
        let packet = {
            let hw = self.shared.hw.lock();
            video.encoder.encode(pic, &hw)?
        };
        video.last_arrival = Instant::now();
        video.stall_repeats = 0;
        let counters = &self.shared.counters;

        if !video.cfr {
            let expected = video.expected_pts.unwrap_or(i64::MIN);
            let pts = frame.pts.unwrap_or(expected.max(0)).max(expected);
            let duration = frame.duration.max(1);
            write_video(&mut session.muxer, video, &packet, pts, duration)?;
            counters.video_frame(packet.len(), false);
            video.expected_pts = Some(pts + duration);
            video.last_packet = Some(packet);
            return Ok(());
        }

        let pts = match (frame.pts, video.expected_pts) {
            (Some(pts), _) => pts,
            (None, Some(expected)) => expected,
            (None, None) => 0,
        };
        if let Some(expected) = video.expected_pts {
            // One tick is one interval: anything before `expected` is more
            // than half an interval early.
            if pts < expected {
                trace!(pts, expected, "Late video frame dropped");
                counters.drop_frame(MediaKind::Video);
                return Ok(());
            }
            let missing = pts - expected;
            if missing > 0 {
                if let Some(last) = video.last_packet.take() {
                    let repeats = missing.min(video.max_repeat as i64);
                    for slot in expected..expected + repeats {
                        write_video(&mut session.muxer, video, &last, slot, 1)?;
                        counters.video_frame(last.len(), true);
                    }
                    if missing > repeats {
                        debug!(missing, max_repeat = video.max_repeat, "Video gap too long, timeline jumps");
                    }
                }
            }
        }
        write_video(&mut session.muxer, video, &packet, pts, 1)?;
        counters.video_frame(packet.len(), false);
        video.expected_pts = Some(pts + 1);
        video.last_packet = Some(packet);
        Ok(())
    }

    /// Re-emit the last picture while video is stalled and audio has moved
    /// past the next expected slot.
    fn repeat_on_stall(&mut self) -> Result<bool, EncodeError> {
        let audio_end_us = self.audio_end_us;
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if session.audio.is_none() {
            return Ok(false);
        }
        let Some(video) = session.video.as_mut() else {
            return Ok(false);
        };
        let (Some(expected), Some(last)) = (video.expected_pts, video.last_packet.as_ref()) else {
            return Ok(false);
        };
        if !video.cfr
            || video.stall_repeats >= video.max_repeat
            || video.last_arrival.elapsed() < video.stall_timeout
            || audio_end_us <= to_micros(expected, video.time_base)
        {
            return Ok(false);
        }
        let last = last.clone();
        write_video(&mut session.muxer, video, &last, expected, 1)?;
        self.shared.counters.video_frame(last.len(), true);
        video.expected_pts = Some(expected + 1);
        video.stall_repeats += 1;
        trace!(pts = expected, "Video stalled, repeating last frame");
        Ok(true)
    }

    fn bind_hardware(&self) -> Result<(), EncodeError> {
        let (registry, device) = self
            .hardware
            .as_ref()
            .ok_or_else(|| EncodeError::Hardware("device surface but no hardware was set".into()))?;
        let mut hw = self.shared.hw.lock();
        registry
            .setup_for_encoding(&mut hw, *device)
            .map_err(|e| EncodeError::Hardware(e.to_string()))
    }
}

fn write_video(
    muxer: &mut FileMuxer,
    video: &VideoPath,
    packet: &[u8],
    pts: i64,
    duration: i64,
) -> Result<(), EncodeError> {
    let pts_ms = rescale(pts, video.time_base, Rational::MILLIS);
    let duration_ms = rescale(duration, video.time_base, Rational::MILLIS);
    muxer.write_block(video.track, pts_ms, duration_ms, packet, true)?;
    Ok(())
}

fn encode_audio(
    shared: &Shared,
    muxer: &mut FileMuxer,
    audio: &mut AudioPath,
    mut frame: Frame,
) -> Result<(), EncodeError> {
    if frame.time_base != audio.time_base {
        frame.rescale_to(audio.time_base);
    }
    let block = frame
        .as_audio()
        .ok_or_else(|| EncodeError::mismatch("video picture on the audio path"))?;
    audio.encoder.check(block)?;
    audio.fifo.write(&block.samples, frame.pts);
    while let Some(chunk) = audio.fifo.read(audio.encoder.frame_size()) {
        write_audio_block(shared, muxer, audio, &chunk)?;
    }
    Ok(())
}

fn write_audio_tail(
    shared: &Shared,
    muxer: &mut FileMuxer,
    audio: &mut AudioPath,
) -> Result<(), EncodeError> {
    if let Some(tail) = audio.fifo.flush() {
        debug!(samples = tail.nb_samples, "Encoder: final short audio block");
        write_audio_block(shared, muxer, audio, &tail)?;
    }
    Ok(())
}

fn write_audio_block(
    shared: &Shared,
    muxer: &mut FileMuxer,
    audio: &mut AudioPath,
    chunk: &crate::fifo::AudioBlock,
) -> Result<(), EncodeError> {
    let packet = audio.encoder.encode(&chunk.samples)?;
    let pts_ms = rescale(chunk.pts, audio.time_base, Rational::MILLIS);
    let duration_ms = rescale(chunk.nb_samples as i64, audio.time_base, Rational::MILLIS);
    muxer.write_block(audio.track, pts_ms, duration_ms, &packet, true)?;
    shared.counters.audio_block(chunk.nb_samples, packet.len());
    Ok(())
}

/// Write the trailer and publish the container statistics.
fn finalize(shared: &Shared, mut session: Session) {
    match session.muxer.finish() {
        Ok(stats) => {
            info!(
                path = %session.path.display(),
                bytes = stats.bytes_written,
                clusters = stats.clusters,
                duration_ms = stats.duration_ms,
                "Encoder output finalized"
            );
            *shared.mux_stats.lock() = Some(stats);
        }
        Err(e) => warn!(error = %e, path = %session.path.display(), "Writing trailer failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::{AudioFrame, VideoFrame};

    fn temp_path(name: &str, ext: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "capline-encoder-{name}-{}-{:?}.{ext}",
            std::process::id(),
            thread::current().id()
        ))
    }

    fn video_options(width: u32, height: u32) -> Options {
        let mut opts = Options::new();
        opts.insert("width".into(), width.to_string());
        opts.insert("height".into(), height.to_string());
        opts.insert("framerate".into(), "10".into());
        opts
    }

    fn picture(pts: i64) -> Frame {
        Frame::video(VideoFrame::new(PixelFormat::Rgba, 4, 2), Some(pts), Rational::new(1, 10))
            .with_duration(1)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn unknown_codec_fails_open() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("badcodec", "mkv");
        let err = enc
            .open(&path, None, Some("mp3"), true, &Options::new())
            .unwrap_err();
        assert!(matches!(err, MediaError::CodecOpen { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn unknown_extension_fails_open() {
        let enc = Encoder::new(EncoderConfig::default());
        let err = enc
            .open(temp_path("ext", "avi"), None, Some("pcm_s16le"), true, &Options::new())
            .unwrap_err();
        assert!(matches!(err, MediaError::MuxerOpen { .. }));
    }

    #[test]
    fn video_into_audio_only_container_fails_open() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("mka", "mka");
        let err = enc
            .open(&path, Some("rawvideo"), None, true, &video_options(4, 2))
            .unwrap_err();
        assert!(matches!(err, MediaError::MuxerOpen { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn formats_follow_options() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("formats", "mkv");
        let mut opts = video_options(4, 2);
        opts.insert("sample_rate".into(), "44100".into());
        opts.insert("channels".into(), "1".into());
        enc.open(&path, Some("rawvideo"), Some("pcm_f32le"), true, &opts)
            .unwrap();

        match enc.format(MediaKind::Video).unwrap() {
            StreamFormat::Video { width, height, time_base, .. } => {
                assert_eq!((width, height), (4, 2));
                assert_eq!(time_base, Rational::new(1, 10));
            }
            other => panic!("unexpected {other:?}"),
        }
        match enc.format(MediaKind::Audio).unwrap() {
            StreamFormat::Audio { sample_rate, channels, .. } => {
                assert_eq!((sample_rate, channels), (44_100, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!enc.ready());
        enc.stop();
        assert!(enc.mux_stats().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn disabled_kind_starts_with_its_bits_set() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("audio-only", "mka");
        enc.open(&path, None, Some("pcm_s16le"), true, &Options::new())
            .unwrap();
        assert_eq!(enc.eof_bits(), EOF_VIDEO);
        assert!(!enc.accepts(MediaKind::Video));
        assert!(enc.accepts(MediaKind::Audio));
        assert!(!enc.eof());
        enc.stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn consume_drops_when_full() {
        let config = EncoderConfig {
            video_buffer: 2,
            ..EncoderConfig::default()
        };
        let enc = Encoder::new(config);
        let path = temp_path("full", "mkv");
        enc.open(&path, Some("rawvideo"), None, true, &video_options(4, 2))
            .unwrap();
        assert!(enc.consume(picture(0), MediaKind::Video));
        assert!(enc.consume(picture(1), MediaKind::Video));
        assert!(enc.full(MediaKind::Video));
        assert!(!enc.consume(picture(2), MediaKind::Video));
        assert_eq!(enc.stats().dropped(MediaKind::Video), 1);

        enc.enable(MediaKind::Video, false);
        assert!(!enc.accepts(MediaKind::Video));
        enc.stop();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn audio_fifo_blocks_and_tail() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("fifo", "mka");
        enc.open(&path, None, Some("pcm_s16le"), true, &Options::new())
            .unwrap();
        enc.run().unwrap();

        let tb = Rational::new(1, 48_000);
        let mut pts = 0;
        for n in [512usize, 512, 64] {
            let block = AudioFrame::silence(48_000, 2, n);
            assert!(enc.consume(Frame::audio(block, Some(pts), tb), MediaKind::Audio));
            pts += n as i64;
        }
        assert!(wait_for(|| enc.stats().audio_blocks == 1));
        // the 64-sample remainder waits for more input
        thread::sleep(Duration::from_millis(30));
        assert_eq!(enc.stats().audio_samples, 1024);
        assert!(!enc.eof());

        enc.notify_eos(MediaKind::Audio);
        enc.wait();
        assert!(enc.eof());
        let stats = enc.stats();
        assert_eq!(stats.audio_blocks, 2);
        assert_eq!(stats.audio_samples, 1088);
        assert!(enc.mux_stats().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn gaps_are_filled_and_late_frames_dropped() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("cfr", "mkv");
        enc.open(&path, Some("rawvideo"), None, true, &video_options(4, 2))
            .unwrap();
        enc.run().unwrap();

        for pts in [0, 1, 4, 3, 5] {
            assert!(wait_for(|| !enc.full(MediaKind::Video)));
            assert!(enc.consume(picture(pts), MediaKind::Video));
        }
        enc.notify_eos(MediaKind::Video);
        enc.wait();

        let stats = enc.stats();
        // 0 1 [2 3 repeated] 4 (3 dropped) 5
        assert_eq!(stats.repeated_frames, 2);
        assert_eq!(stats.video_frames, 6);
        assert_eq!(stats.dropped(MediaKind::Video), 1);
        assert!(enc.eof());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn encode_error_closes_only_that_kind() {
        let enc = Encoder::new(EncoderConfig::default());
        let path = temp_path("isolate", "mkv");
        enc.open(&path, Some("rawvideo"), Some("pcm_s16le"), true, &video_options(4, 2))
            .unwrap();
        enc.run().unwrap();

        let wrong = Frame::video(VideoFrame::new(PixelFormat::Rgba, 8, 8), Some(0), Rational::new(1, 10));
        assert!(enc.consume(wrong, MediaKind::Video));
        assert!(wait_for(|| enc.failed(MediaKind::Video)));
        assert_eq!(enc.eof_bits(), EOF_VIDEO);
        assert!(!enc.accepts(MediaKind::Video));

        let tb = Rational::new(1, 48_000);
        assert!(enc.consume(Frame::audio(AudioFrame::silence(48_000, 2, 2048), Some(0), tb), MediaKind::Audio));
        enc.notify_eos(MediaKind::Audio);
        enc.wait();
        assert!(enc.eof());
        assert_eq!(enc.stats().audio_blocks, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn run_requires_open_and_runs_once() {
        let enc = Encoder::new(EncoderConfig::default());
        assert!(matches!(enc.run(), Err(MediaError::NotReady(_))));

        let path = temp_path("twice", "mka");
        enc.open(&path, None, Some("pcm_s16le"), true, &Options::new())
            .unwrap();
        enc.run().unwrap();
        assert!(matches!(enc.run(), Err(MediaError::AlreadyRunning)));
        enc.stop();
        enc.stop();
        assert!(!enc.ready());
        let _ = std::fs::remove_file(&path);
    }
}
