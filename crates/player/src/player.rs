//! Playback engine.
//!
//! A [`Player`] owns three concurrent actors around one shared state:
//!
//! - `player-delivery` moves frames from the source's channel into the
//!   per-kind queues and completes seeks on the first frame that follows.
//! - `video-pacing` pops pictures and holds each one until the timeline
//!   reaches its timestamp, then presents it.
//! - The audio device's pull callback feeds the time-stretcher from the
//!   audio queue and re-anchors the timeline on every pull.
//!
//! Control calls (`play`, `pause`, `seek`, ...) only flip flags, move the
//! timeline, and stop/start queues, so none of them wait on a worker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capline_audio::{AudioRenderer, RendererOptions, Timeline};
use capline_common::{
    frame_channel, to_nanos, Frame, FrameEvent, FrameReceiver, MediaError, MediaKind,
    PixelFormat, Producer, Recv, SafeQueue, StreamFormat, NOPTS,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::AudioClock;
use crate::error::{PlayerError, PlayerResult};
use crate::options::{PlayerOptions, PlayerState};
use crate::video::{adapt, NullVideoRenderer, VideoRenderer};

/// Poll interval of the pacing and delivery threads.
const IDLE_SLEEP: Duration = Duration::from_millis(15);
/// Longest single pacing sleep; the wait is re-evaluated afterwards.
const MAX_PACING_SLEEP: Duration = Duration::from_millis(300);
/// Pictures due sooner than this are shown immediately.
const MIN_PACING_SLEEP: Duration = Duration::from_millis(5);

const VIDEO: usize = 0;
const AUDIO: usize = 1;

// ── Shared state ─────────────────────────────────────────────────────

struct Shared {
    source: Arc<dyn Producer>,
    receiver: FrameReceiver,
    has: [bool; 2],
    live: bool,
    timeline: Timeline,
    queues: [SafeQueue<Frame>; 2],
    state: Mutex<PlayerState>,
    running: AtomicBool,
    paused: AtomicBool,
    seeking: AtomicBool,
    /// Bumped by every seek. A picture popped under an older epoch is stale.
    epoch: AtomicU64,
    steps: AtomicU32,
    /// Epoch of a paused seek whose first picture is still to be shown;
    /// zero when none is pending.
    preview: AtomicU64,
    done: [AtomicBool; 2],
    /// End of stream as reported through the frame channel.
    source_eos: [AtomicBool; 2],
    completed: AtomicBool,
    /// Set until the first event after a seek has been delivered. Held for
    /// the whole seek, which keeps delivery out meanwhile.
    awaiting_first: Mutex<bool>,
    seek_target_us: AtomicI64,
    audio: Mutex<Option<AudioClock>>,
    audio_renderer: Mutex<Box<dyn AudioRenderer>>,
    /// Last known device queue depth, for pulls that cannot lock the renderer.
    device_latency: AtomicUsize,
    video_renderer: Mutex<Box<dyn VideoRenderer>>,
    video_formats: Vec<PixelFormat>,
    presented: AtomicU64,
}

impl Shared {
    fn state(&self) -> PlayerState {
        *self.state.lock()
    }

    /// Timeline position, or the pending seek target until the first frame
    /// after the seek anchors the timeline.
    fn position_us(&self) -> Option<i64> {
        match self.timeline.now() {
            Some(ns) => Some(ns / 1000),
            None => {
                let target = self.seek_target_us.load(Ordering::Acquire);
                (target != NOPTS).then_some(target)
            }
        }
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if *state != PlayerState::Playing {
            return;
        }
        self.paused.store(true, Ordering::Release);
        self.timeline.pause();
        *state = PlayerState::Paused;
        debug!(position_us = ?self.position_us(), "Paused");
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if *state != PlayerState::Paused {
            return;
        }
        self.steps.store(0, Ordering::Release);
        self.preview.store(0, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.timeline.resume();
        *state = PlayerState::Playing;
        debug!(position_us = ?self.position_us(), "Resumed");
    }

    fn take_step(&self) -> bool {
        self.steps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn stepping(&self) -> bool {
        self.steps.load(Ordering::Acquire) > 0
    }

    fn take_preview(&self, epoch: u64) -> bool {
        self.preview
            .compare_exchange(epoch, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reposition the source. A seek issued while another is still waiting
    /// for its first frame simply replaces the target.
    fn seek(&self, ts_us: i64, relative: bool) -> PlayerResult<()> {
        if self.live {
            return Err(PlayerError::LiveSeek);
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(PlayerError::Stopped);
        }
        let mut awaiting = self.awaiting_first.lock();
        let (target_us, delta_us) = if relative {
            (self.position_us().unwrap_or(0) + ts_us, ts_us)
        } else {
            (ts_us, 0)
        };
        let target_us = target_us.clamp(0, self.source.duration_us().unwrap_or(i64::MAX));

        self.seeking.store(true, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for queue in &self.queues {
            queue.stop();
            queue.clear();
        }
        if let Err(e) = self.source.seek(target_us, delta_us) {
            for queue in &self.queues {
                queue.start();
            }
            self.seeking.store(false, Ordering::Release);
            return Err(e.into());
        }
        let stale = self.receiver.drain();

        if let Some(clock) = self.audio.lock().as_mut() {
            clock.reset();
        }
        self.timeline.reset();
        self.audio_renderer.lock().reset();
        for (i, has) in self.has.iter().enumerate() {
            self.done[i].store(!has, Ordering::Release);
            self.source_eos[i].store(false, Ordering::Release);
        }
        self.completed.store(false, Ordering::Release);
        self.seek_target_us.store(target_us, Ordering::Release);
        // a paused seek still shows the picture it lands on
        let preview = if self.paused.load(Ordering::Acquire) { epoch } else { 0 };
        self.preview.store(preview, Ordering::Release);
        *awaiting = true;
        debug!(target_us, relative, stale, "Seek");
        Ok(())
    }

    // ── Delivery ─────────────────────────────────────────────────────

    /// Take the next event off the channel and queue it. The event is
    /// received under the seek gate, so a seek never races an event that
    /// is already in hand. Returns `false` once the source is gone.
    fn deliver_next(&self) -> bool {
        if !self.receiver.wait_ready(IDLE_SLEEP) {
            return true;
        }
        let mut awaiting = self.awaiting_first.lock();
        let event = match self.receiver.try_recv() {
            Recv::Event(event) => event,
            Recv::Empty => return true,
            Recv::Disconnected => return false,
        };
        if *awaiting {
            for queue in &self.queues {
                queue.clear();
                queue.start();
            }
            if let FrameEvent::Frame(frame) = &event {
                if let (false, Some(pts)) = (self.timeline.is_set(), frame.pts) {
                    self.timeline.set(to_nanos(pts, frame.time_base), Instant::now());
                }
            }
            self.seeking.store(false, Ordering::Release);
            *awaiting = false;
            debug!("First event after seek");
        }
        match event {
            FrameEvent::Frame(frame) => {
                let i = frame.kind().index();
                if self.has[i] {
                    // fails only once the player has stopped
                    let _ = self.queues[i].push(frame);
                }
            }
            FrameEvent::Eos(kind) => {
                self.source_eos[kind.index()].store(true, Ordering::Release);
                debug!(kind = %kind, "Source reached end of stream");
            }
        }
        true
    }

    // ── Video pacing ─────────────────────────────────────────────────

    fn pacing_step(&self) {
        if self.check_completion() {
            return;
        }
        let video_done = self.done[VIDEO].load(Ordering::Acquire);
        if !video_done
            && self.queues[VIDEO].is_empty()
            && self.source_eos[VIDEO].load(Ordering::Acquire)
        {
            self.done[VIDEO].store(true, Ordering::Release);
            debug!(presented = self.presented.load(Ordering::Relaxed), "Video done");
            return;
        }
        let idle = !self.state().is_active()
            || video_done
            || self.seeking.load(Ordering::Acquire)
            || (self.paused.load(Ordering::Acquire)
                && !self.stepping()
                && self.preview.load(Ordering::Acquire) == 0);
        if idle {
            thread::sleep(IDLE_SLEEP);
            return;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        let Some(frame) = self.queues[VIDEO].pop_timeout(IDLE_SLEEP) else {
            return;
        };
        if self.pace(&frame, epoch) {
            self.present(frame);
        }
    }

    /// Hold `frame` until it is due. Returns `false` if it went stale.
    fn pace(&self, frame: &Frame, epoch: u64) -> bool {
        let pts_ns = frame.pts.map(|pts| to_nanos(pts, frame.time_base));
        loop {
            if !self.running.load(Ordering::Acquire) || self.epoch.load(Ordering::Acquire) != epoch
            {
                return false;
            }
            if self.paused.load(Ordering::Acquire) {
                if self.take_preview(epoch) || self.take_step() {
                    if let Some(pts_ns) = pts_ns {
                        self.timeline.set(pts_ns, Instant::now());
                    }
                    return true;
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            }
            if self.live {
                return true;
            }
            let Some(pts_ns) = pts_ns else {
                return true;
            };
            let Some(now_ns) = self.timeline.now() else {
                self.timeline.set(pts_ns, Instant::now());
                return true;
            };
            let ahead_ns = (pts_ns - now_ns) as f64 / self.timeline.speed();
            if ahead_ns < MIN_PACING_SLEEP.as_nanos() as f64 {
                return true;
            }
            thread::sleep(Duration::from_nanos(ahead_ns as u64).min(MAX_PACING_SLEEP));
        }
    }

    fn present(&self, frame: Frame) {
        let pts = frame.pts;
        let Some(frame) = adapt(frame, &self.video_formats) else {
            warn!(?pts, "Renderer cannot show this picture, dropping it");
            return;
        };
        if let Err(e) = self.video_renderer.lock().present(&frame) {
            warn!(error = %e, ?pts, "Video present failed");
            return;
        }
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    /// Both kinds done, or everything drained after the source ended.
    fn check_completion(&self) -> bool {
        if self.completed.load(Ordering::Acquire) || !self.state().is_active() {
            return false;
        }
        let all_done = self.done.iter().all(|d| d.load(Ordering::Acquire));
        let drained = || {
            MediaKind::ALL.into_iter().all(|kind| {
                let i = kind.index();
                !self.has[i]
                    || (self.queues[i].is_empty() && self.source_eos[i].load(Ordering::Acquire))
            }) && self.audio.lock().as_ref().map_or(true, |c| c.buffered() == 0)
        };
        if !all_done && !drained() {
            return false;
        }
        self.completed.store(true, Ordering::Release);
        info!(
            presented = self.presented.load(Ordering::Relaxed),
            live = self.live,
            "Playback reached the end"
        );
        if !self.live {
            self.pause();
            if let Err(e) = self.seek(0, false) {
                warn!(error = %e, "Rewind after completion failed");
            }
        }
        true
    }

    // ── Audio pull ───────────────────────────────────────────────────

    fn pull_audio(&self, buffer: &mut [f32], frames: usize, delivery: Instant) -> usize {
        if self.seeking.load(Ordering::Acquire)
            || self.done[AUDIO].load(Ordering::Acquire)
            || (self.paused.load(Ordering::Acquire) && !self.stepping())
        {
            return 0;
        }
        let mut guard = self.audio.lock();
        let Some(clock) = guard.as_mut() else {
            return 0;
        };
        let ended = self.source_eos[AUDIO].load(Ordering::Acquire);
        clock.fill(&self.queues[AUDIO], frames * 2, ended);

        if let Some(renderer) = self.audio_renderer.try_lock() {
            self.device_latency
                .store(renderer.buffer_size(), Ordering::Relaxed);
        }
        let latency = self.device_latency.load(Ordering::Relaxed);
        if let Some(position_ns) = clock.position_ns(latency, self.timeline.speed()) {
            self.timeline.set(position_ns, delivery);
        }

        let wanted = (frames * clock.channels()).min(buffer.len());
        let written = clock.read(&mut buffer[..wanted]);
        if written == 0 && clock.drained() && self.queues[AUDIO].is_empty() {
            self.done[AUDIO].store(true, Ordering::Release);
            debug!("Audio done");
        }
        written
    }
}

// ── Player ───────────────────────────────────────────────────────────

/// Plays one [`Producer`] through an audio and a video renderer.
pub struct Player {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[cfg(feature = "cpal-output")]
fn default_audio_renderer() -> Box<dyn AudioRenderer> {
    Box::new(capline_audio::CpalAudioRenderer::new())
}

#[cfg(not(feature = "cpal-output"))]
fn default_audio_renderer() -> Box<dyn AudioRenderer> {
    Box::new(capline_audio::NullAudioRenderer::clocked())
}

impl Player {
    /// Open with the default audio output and a headless video renderer.
    pub fn open(source: Arc<dyn Producer>, options: PlayerOptions) -> PlayerResult<Self> {
        Self::with_renderers(
            source,
            options,
            default_audio_renderer(),
            Box::new(NullVideoRenderer::new()),
        )
    }

    pub fn with_renderers(
        source: Arc<dyn Producer>,
        options: PlayerOptions,
        mut audio_renderer: Box<dyn AudioRenderer>,
        video_renderer: Box<dyn VideoRenderer>,
    ) -> PlayerResult<Self> {
        let has = [source.has(MediaKind::Video), source.has(MediaKind::Audio)];
        if !has.iter().any(|h| *h) {
            return Err(PlayerError::NoStreams);
        }
        if !(options.speed.is_finite() && options.speed > 0.0) {
            return Err(PlayerError::InvalidSpeed(options.speed));
        }

        let (sink, receiver) = frame_channel(options.channel_capacity);
        source.set_sink(sink);

        let audio = if has[AUDIO] {
            let wanted = match source.format(MediaKind::Audio) {
                Some(StreamFormat::Audio {
                    sample_rate,
                    channels,
                    ..
                }) => RendererOptions {
                    sample_rate,
                    channels,
                    period_frames: options.period_frames,
                },
                _ => RendererOptions {
                    period_frames: options.period_frames,
                    ..RendererOptions::default()
                },
            };
            audio_renderer.open(options.audio_device.as_deref(), &wanted)?;
            let actual = audio_renderer.options().unwrap_or(wanted);
            let mut clock = AudioClock::new(&actual);
            clock.set_speed(options.speed);
            info!(
                sample_rate = actual.sample_rate,
                channels = actual.channels,
                "Audio output opened"
            );
            Some(clock)
        } else {
            None
        };
        audio_renderer.set_volume(options.volume);
        audio_renderer.set_mute(options.muted);

        let timeline = Timeline::new();
        timeline.set_speed(options.speed);
        let live = options.live || source.is_live();
        let video_formats = video_renderer.supported_formats();

        let shared = Arc::new(Shared {
            source,
            receiver,
            has,
            live,
            timeline,
            queues: [SafeQueue::new(), SafeQueue::new()],
            state: Mutex::new(PlayerState::Idle),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            steps: AtomicU32::new(0),
            preview: AtomicU64::new(0),
            done: [AtomicBool::new(!has[VIDEO]), AtomicBool::new(!has[AUDIO])],
            source_eos: [AtomicBool::new(false), AtomicBool::new(false)],
            completed: AtomicBool::new(false),
            awaiting_first: Mutex::new(true),
            seek_target_us: AtomicI64::new(NOPTS),
            audio: Mutex::new(audio),
            device_latency: AtomicUsize::new(audio_renderer.buffer_size()),
            audio_renderer: Mutex::new(audio_renderer),
            video_renderer: Mutex::new(video_renderer),
            video_formats,
            presented: AtomicU64::new(0),
        });

        if has[AUDIO] {
            let weak = Arc::downgrade(&shared);
            shared
                .audio_renderer
                .lock()
                .set_callback(Box::new(move |buffer, frames, delivery| {
                    match weak.upgrade() {
                        Some(shared) => shared.pull_audio(buffer, frames, delivery),
                        None => 0,
                    }
                }));
        }

        let player = Self {
            shared,
            threads: Mutex::new(Vec::new()),
        };
        player.spawn("player-delivery", |shared| {
            while shared.running.load(Ordering::Acquire) && shared.deliver_next() {}
        })?;
        player.spawn("video-pacing", |shared| {
            while shared.running.load(Ordering::Acquire) {
                shared.pacing_step();
            }
        })?;

        info!(
            video = has[VIDEO],
            audio = has[AUDIO],
            live,
            speed = options.speed,
            "Player opened"
        );
        Ok(player)
    }

    fn spawn(&self, name: &str, body: fn(&Shared)) -> PlayerResult<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || body(&shared))
            .map_err(MediaError::Io)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Start the source and the audio device, or resume when paused.
    pub fn play(&self) -> PlayerResult<()> {
        let mut state = self.shared.state.lock();
        match *state {
            PlayerState::Stopped => Err(PlayerError::Stopped),
            PlayerState::Playing => Ok(()),
            PlayerState::Paused => {
                drop(state);
                self.shared.resume();
                Ok(())
            }
            PlayerState::Idle => {
                self.shared.source.start()?;
                if self.shared.has[AUDIO] {
                    let mut renderer = self.shared.audio_renderer.lock();
                    if let Err(e) = renderer.start() {
                        drop(renderer);
                        self.shared.source.stop();
                        return Err(e.into());
                    }
                    self.shared
                        .device_latency
                        .store(renderer.buffer_size(), Ordering::Relaxed);
                }
                *state = PlayerState::Playing;
                info!("Playback started");
                Ok(())
            }
        }
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    pub fn resume(&self) {
        self.shared.resume();
    }

    /// Show one more picture while paused. Returns `false` when not paused.
    pub fn step(&self) -> bool {
        if self.shared.state() != PlayerState::Paused {
            return false;
        }
        self.shared.steps.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Jump to `ts_us`, or by `ts_us` from the current position when
    /// `relative`. The position reads the target until the first frame from
    /// the new position re-anchors the clock. While paused, that frame is
    /// shown.
    pub fn seek(&self, ts_us: i64, relative: bool) -> PlayerResult<()> {
        self.shared.seek(ts_us, relative)
    }

    pub fn set_speed(&self, speed: f64) -> PlayerResult<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(PlayerError::InvalidSpeed(speed));
        }
        self.shared.timeline.set_speed(speed);
        if let Some(clock) = self.shared.audio.lock().as_mut() {
            clock.set_speed(speed);
        }
        debug!(speed, "Playback speed changed");
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.shared.timeline.speed()
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.audio_renderer.lock().set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.shared.audio_renderer.lock().volume()
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.audio_renderer.lock().set_mute(muted);
    }

    pub fn muted(&self) -> bool {
        self.shared.audio_renderer.lock().mute()
    }

    /// Current media position, once known.
    pub fn position_us(&self) -> Option<i64> {
        self.shared.position_us()
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.shared.source.duration_us()
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    pub fn is_live(&self) -> bool {
        self.shared.live
    }

    /// Handle on the playback clock.
    pub fn timeline(&self) -> Timeline {
        self.shared.timeline.clone()
    }

    pub fn presented_frames(&self) -> u64 {
        self.shared.presented.load(Ordering::Relaxed)
    }

    /// Stop everything and join the worker threads. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == PlayerState::Stopped {
                return;
            }
            *state = PlayerState::Stopped;
        }
        self.shared.running.store(false, Ordering::Release);
        for queue in &self.shared.queues {
            queue.stop();
        }
        self.shared.source.stop();
        if let Err(e) = self.shared.audio_renderer.lock().stop() {
            warn!(error = %e, "Audio output did not stop cleanly");
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Player thread panicked");
            }
        }
        self.shared.timeline.pause();
        info!(
            presented = self.shared.presented.load(Ordering::Relaxed),
            "Player stopped"
        );
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state())
            .field("position_us", &self.position_us())
            .field("live", &self.shared.live)
            .finish()
    }
}
