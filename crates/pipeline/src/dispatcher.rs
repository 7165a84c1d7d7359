//! Frame dispatcher: producers → processing graphs → one consumer.
//!
//! ```text
//!  Producer A ──chan──┐                 ┌─▶ video graph ─┐
//!                     ├─ dispatcher-pump ┤                ├─▶ Consumer
//!  Producer B ──chan──┘                 └─▶ audio graph ─┘
//! ```
//!
//! Lifecycle: `Idle → GraphBuilt → Running ⇄ Paused → Stopped`.
//!
//! The pump thread never blocks on a single media kind. Each iteration it
//! drains whatever every graph has ready into the consumer (backing off
//! while the consumer reports `full`), then feeds a bounded batch of
//! events from every producer channel. Frames that reach the output while
//! paused are dropped so producers keep running.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capline_common::{
    frame_channel, rescale, to_micros, Consumer, DeviceType, Frame, FrameEvent, FrameReceiver,
    MediaError, MediaKind, MediaResult, PipelineConfig, Producer, Rational, Recv,
};
use capline_gpu_hal::DeviceRegistry;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::graph::FilterGraph;

/// Frames allowed to wait at a graph output before inputs stop being read.
const MAX_PENDING: usize = 8;

/// Events taken from one producer channel per pump iteration.
const FEED_BATCH: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    GraphBuilt,
    Running,
    Paused,
    Stopped,
}

/// Presentation clock bookkeeping, all in microseconds.
#[derive(Debug, Default)]
struct Clock {
    /// Wall instant of the first stamped frame.
    first_at: Option<Instant>,
    paused_at: Option<Instant>,
    /// Accumulated pause time.
    offset: Duration,
    /// Source timestamp of the first stamped frame.
    first_pts_us: Option<i64>,
    /// Last timestamp handed to the consumer, either kind.
    last_out_us: i64,
    /// Last timestamp handed to the consumer per kind.
    kind_out_us: [i64; 2],
    /// Re-anchor on the next frame (after a seek).
    rebase: bool,
}

impl Clock {
    fn escaped(&self, now: Instant) -> Duration {
        let Some(first) = self.first_at else {
            return Duration::ZERO;
        };
        let end = self.paused_at.unwrap_or(now);
        end.saturating_duration_since(first).saturating_sub(self.offset)
    }

    /// Map a source timestamp to the consumer's zero-based timeline.
    /// Output never goes backwards within a kind.
    fn stamp(&mut self, kind: MediaKind, pts_us: i64) -> i64 {
        if self.first_at.is_none() {
            self.first_at = Some(Instant::now());
        }
        let offset = self.offset.as_micros() as i64;
        if self.rebase {
            self.first_pts_us = Some(pts_us - self.last_out_us - offset);
            self.rebase = false;
        }
        let first = *self.first_pts_us.get_or_insert(pts_us);
        let last = &mut self.kind_out_us[kind.index()];
        let out = (pts_us - first - offset).max(0).max(*last);
        *last = out;
        self.last_out_us = self.last_out_us.max(out);
        out
    }
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
    eos_sent: [AtomicBool; 2],
    /// Bumped by every seek; the pump flushes graph output when it changes.
    seeks: AtomicU64,
    clock: Mutex<Clock>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            eos_sent: [AtomicBool::new(false), AtomicBool::new(false)],
            seeks: AtomicU64::new(0),
            clock: Mutex::new(Clock::default()),
        }
    }
}

/// Routes producer frames through per-kind graphs into a consumer.
pub struct Dispatcher {
    config: PipelineConfig,
    registry: Option<Arc<DeviceRegistry>>,
    hwaccel: Option<DeviceType>,
    producers: Vec<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
    descriptions: [String; 2],
    graphs: [Option<FilterGraph>; 2],
    receivers: Vec<FrameReceiver>,
    state: DispatcherState,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(config: PipelineConfig) -> Self {
        let hwaccel = config.hwaccel;
        let descriptions = [config.video_filters.clone(), config.audio_filters.clone()];
        Self {
            config,
            registry: None,
            hwaccel,
            producers: Vec::new(),
            consumer: None,
            descriptions,
            graphs: [None, None],
            receivers: Vec::new(),
            state: DispatcherState::Idle,
            shared: Arc::new(Shared::new()),
            pump: None,
        }
    }

    /// Registry used by hardware graph nodes.
    pub fn set_registry(&mut self, registry: Arc<DeviceRegistry>) {
        self.registry = Some(registry);
    }

    pub fn set_hwaccel(&mut self, device: Option<DeviceType>) {
        self.hwaccel = device;
    }

    /// Register a producer. It feeds every kind it `has()`.
    pub fn append(&mut self, producer: Arc<dyn Producer>) -> MediaResult<()> {
        self.ensure_stopped()?;
        debug!(
            video = producer.has(MediaKind::Video),
            audio = producer.has(MediaKind::Audio),
            index = self.producers.len(),
            "Dispatcher: producer appended"
        );
        self.producers.push(producer);
        Ok(())
    }

    pub fn set_consumer(&mut self, consumer: Arc<dyn Consumer>) -> MediaResult<()> {
        self.ensure_stopped()?;
        self.consumer = Some(consumer);
        Ok(())
    }

    fn ensure_stopped(&self) -> MediaResult<()> {
        match self.state {
            DispatcherState::Running | DispatcherState::Paused => Err(MediaError::AlreadyRunning),
            _ => Ok(()),
        }
    }

    fn producers_of(&self, kind: MediaKind) -> usize {
        self.producers.iter().filter(|p| p.has(kind)).count()
    }

    /// Build the video and audio graphs.
    ///
    /// A non-empty description for a kind without producers fails with
    /// `NoProducer`. An empty description is a pass-through for kinds that
    /// have producers and no graph for kinds that have none.
    pub fn create_filter_graph(&mut self, video_desc: &str, audio_desc: &str) -> MediaResult<()> {
        self.ensure_stopped()?;
        if self.producers.is_empty() {
            return Err(MediaError::NoProducer(MediaKind::Video));
        }

        let mut graphs: [Option<FilterGraph>; 2] = [None, None];
        for (kind, desc) in [(MediaKind::Video, video_desc), (MediaKind::Audio, audio_desc)] {
            let count = self.producers_of(kind);
            if count == 0 {
                if !desc.trim().is_empty() {
                    return Err(MediaError::NoProducer(kind));
                }
                continue;
            }
            if let Some(consumer) = &self.consumer {
                if !consumer.accepts(kind) {
                    warn!(kind = %kind, "Consumer does not accept this kind; no graph built");
                    continue;
                }
            }

            let mut graph = FilterGraph::build(kind, desc, count)?;
            if let Some(format) = self.consumer.as_ref().and_then(|c| c.format(kind)) {
                graph.adapt_output(&format);
            }
            if graph.needs_device() {
                self.bind_device(&mut graph)?;
            }
            graphs[kind.index()] = Some(graph);
        }

        self.graphs = graphs;
        self.descriptions = [video_desc.to_string(), audio_desc.to_string()];
        self.state = DispatcherState::GraphBuilt;
        info!(
            video = self.graphs[0].is_some(),
            audio = self.graphs[1].is_some(),
            "Dispatcher: filter graphs built"
        );
        Ok(())
    }

    fn bind_device(&self, graph: &mut FilterGraph) -> MediaResult<()> {
        let device = self
            .hwaccel
            .ok_or_else(|| MediaError::NotReady("graph uploads to hardware but no hwaccel is set".into()))?;
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| MediaError::NotReady("no device registry".into()))?;
        registry.bind_to_graph(graph, device)?;
        Ok(())
    }

    /// Start the producers, the consumer and the pump thread.
    pub fn start(&mut self) -> MediaResult<()> {
        self.ensure_stopped()?;
        let consumer = self
            .consumer
            .clone()
            .ok_or_else(|| MediaError::NotReady("dispatcher has no consumer".into()))?;
        if self.state != DispatcherState::GraphBuilt {
            let [video, audio] = self.descriptions.clone();
            self.create_filter_graph(&video, &audio)?;
        }

        let mut inputs = Vec::with_capacity(self.producers.len());
        let mut seen = [0usize; 2];
        self.receivers.clear();
        for producer in &self.producers {
            let (tx, rx) = frame_channel(self.config.channel_capacity);
            producer.set_sink(tx);
            let mut pads = [None, None];
            for kind in MediaKind::ALL {
                if producer.has(kind) {
                    let idx = kind.index();
                    if self.graphs[idx].is_some() {
                        pads[idx] = Some(seen[idx]);
                    }
                    seen[idx] += 1;
                }
            }
            self.receivers.push(rx.clone());
            inputs.push(PumpInput { receiver: rx, pads });
        }

        if !consumer.ready() {
            consumer.run()?;
        }
        for producer in &self.producers {
            if !producer.is_running() {
                producer.start()?;
            }
        }

        self.shared = Arc::new(Shared::new());
        self.shared.running.store(true, Ordering::Release);
        let targets = MediaKind::ALL.map(|k| consumer.format(k).map(|f| f.time_base()));
        let pump = Pump {
            shared: Arc::clone(&self.shared),
            consumer,
            graphs: std::mem::take(&mut self.graphs),
            inputs,
            targets,
            poll: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            hardware: self.registry.clone().zip(self.hwaccel),
            frames_bound: false,
            eos_sent: [false; 2],
            seeks_seen: 0,
            dropped: 0,
        };
        let handle = thread::Builder::new()
            .name("dispatcher-pump".to_string())
            .spawn(move || pump.run())?;
        self.pump = Some(handle);
        self.state = DispatcherState::Running;
        info!(producers = self.producers.len(), "Dispatcher: started");
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state != DispatcherState::Running {
            return;
        }
        self.shared.clock.lock().paused_at = Some(Instant::now());
        self.shared.paused.store(true, Ordering::Release);
        self.state = DispatcherState::Paused;
        debug!(escaped_us = self.escaped_us(), "Dispatcher: paused");
    }

    pub fn resume(&mut self) {
        if self.state != DispatcherState::Paused {
            return;
        }
        {
            let mut clock = self.shared.clock.lock();
            if let Some(at) = clock.paused_at.take() {
                if clock.first_at.is_some() {
                    clock.offset += at.elapsed();
                }
            }
        }
        self.shared.paused.store(false, Ordering::Release);
        self.state = DispatcherState::Running;
        debug!(escaped_us = self.escaped_us(), "Dispatcher: resumed");
    }

    /// Reposition every producer. Output timestamps continue from the last
    /// one handed to the consumer; frames in flight at the time of the seek
    /// are discarded.
    pub fn seek(&mut self, position_us: i64, delta_us: i64) -> MediaResult<()> {
        if !matches!(self.state, DispatcherState::Running | DispatcherState::Paused) {
            return Err(MediaError::NotReady("dispatcher is not running".into()));
        }
        for producer in &self.producers {
            producer.seek(position_us, delta_us)?;
        }
        let dropped: usize = self.receivers.iter().map(FrameReceiver::drain).sum();
        self.shared.seeks.fetch_add(1, Ordering::AcqRel);
        debug!(position_us, delta_us, dropped, "Dispatcher: seek");
        Ok(())
    }

    /// Stop the pump, the producers and release the graphs. Kinds that did
    /// not finish get `notify_eos` so the consumer can flush. Idempotent.
    pub fn reset(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let had_pump = self.pump.is_some();
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                warn!("Dispatcher: pump thread panicked");
            }
        }
        for producer in &self.producers {
            producer.stop();
        }
        if had_pump {
            if let Some(consumer) = &self.consumer {
                for kind in MediaKind::ALL {
                    let idx = kind.index();
                    if self.shared.eos_sent[idx].swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    if self.producers_of(kind) > 0 && consumer.accepts(kind) {
                        consumer.notify_eos(kind);
                    }
                }
            }
        }
        self.graphs = [None, None];
        self.receivers.clear();
        *self.shared.clock.lock() = Clock::default();
        self.shared.paused.store(false, Ordering::Release);
        if self.state != DispatcherState::Idle || had_pump {
            self.state = DispatcherState::Stopped;
        }
        if had_pump {
            info!("Dispatcher: stopped");
        }
    }

    pub fn stop(&mut self) {
        self.reset();
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, DispatcherState::Running | DispatcherState::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.state == DispatcherState::Paused
    }

    /// Every graph has drained and the consumer got `notify_eos` for it.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn has_audio(&self) -> bool {
        self.producers_of(MediaKind::Audio) > 0
    }

    /// Presentation time elapsed since the first frame, excluding pauses.
    pub fn escaped_us(&self) -> i64 {
        self.shared.clock.lock().escaped(Instant::now()).as_micros() as i64
    }

    pub fn escaped_ms(&self) -> i64 {
        self.escaped_us() / 1000
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state)
            .field("producers", &self.producers.len())
            .field("has_consumer", &self.consumer.is_some())
            .field("hwaccel", &self.hwaccel)
            .finish()
    }
}

// ── Pump thread ──────────────────────────────────────────────────

struct PumpInput {
    receiver: FrameReceiver,
    /// Graph input index per media kind.
    pads: [Option<usize>; 2],
}

struct Pump {
    shared: Arc<Shared>,
    consumer: Arc<dyn Consumer>,
    graphs: [Option<FilterGraph>; 2],
    inputs: Vec<PumpInput>,
    /// Consumer time base per kind.
    targets: [Option<Rational>; 2],
    poll: Duration,
    /// Registry that receives the video graph's frames context.
    hardware: Option<(Arc<DeviceRegistry>, DeviceType)>,
    frames_bound: bool,
    eos_sent: [bool; 2],
    seeks_seen: u64,
    dropped: u64,
}

impl Pump {
    fn run(mut self) {
        info!("Dispatcher pump started");
        while self.shared.running.load(Ordering::Acquire) {
            self.settle_seek();
            let mut progressed = self.drain_outputs();
            for input in &mut self.inputs {
                progressed |= feed(input, &mut self.graphs);
            }
            if self.all_delivered() {
                self.shared.finished.store(true, Ordering::Release);
                info!(dropped = self.dropped, "Dispatcher pump: all streams delivered");
                break;
            }
            if !progressed {
                thread::sleep(self.poll);
            }
        }
        debug!(dropped = self.dropped, "Dispatcher pump exiting");
    }

    /// After a seek, drop what the graphs produced from pre-seek input and
    /// re-anchor the clock on the next frame out.
    fn settle_seek(&mut self) {
        let seeks = self.shared.seeks.load(Ordering::Acquire);
        if seeks == self.seeks_seen {
            return;
        }
        self.seeks_seen = seeks;
        let stale: usize = self
            .graphs
            .iter_mut()
            .flatten()
            .map(FilterGraph::discard_output)
            .sum();
        self.dropped += stale as u64;
        self.shared.clock.lock().rebase = true;
        debug!(stale, "Dispatcher pump: seek settled");
    }

    fn drain_outputs(&mut self) -> bool {
        let mut progressed = false;
        for kind in MediaKind::ALL {
            let idx = kind.index();
            let Some(graph) = self.graphs[idx].as_mut() else {
                continue;
            };
            loop {
                let paused = self.shared.paused.load(Ordering::Acquire);
                let accepts = self.consumer.accepts(kind);
                if !paused && accepts && self.consumer.full(kind) {
                    break;
                }
                let Some(frame) = graph.pull() else {
                    break;
                };
                progressed = true;
                if !self.frames_bound && frame.as_video().is_some_and(|v| v.hw.is_some()) {
                    if let Some((registry, device)) = &self.hardware {
                        match registry.bind_frames_context(&*graph, *device) {
                            Ok(_) => self.frames_bound = true,
                            Err(err) => warn!(error = %err, "Dispatcher pump: frames context not captured"),
                        }
                    }
                }
                if paused || !accepts {
                    self.dropped += 1;
                    continue;
                }
                let frame = stamp(&self.shared, kind, self.targets[idx], frame);
                trace!(kind = %kind, pts = ?frame.pts, "Dispatching frame");
                if !self.consumer.consume(frame, kind) {
                    self.dropped += 1;
                }
            }
            if graph.is_finished() && !self.eos_sent[idx] {
                self.eos_sent[idx] = true;
                if !self.shared.eos_sent[idx].swap(true, Ordering::AcqRel) {
                    self.consumer.notify_eos(kind);
                }
                debug!(kind = %kind, "Dispatcher pump: end of stream");
                progressed = true;
            }
        }
        progressed
    }

    fn all_delivered(&self) -> bool {
        MediaKind::ALL
            .into_iter()
            .all(|k| self.graphs[k.index()].is_none() || self.eos_sent[k.index()])
    }
}

/// Rescale into the consumer time base on the zero-based output timeline.
fn stamp(shared: &Shared, kind: MediaKind, target: Option<Rational>, mut frame: Frame) -> Frame {
    let target = target.unwrap_or(frame.time_base);
    match frame.pts {
        Some(pts) => {
            let out_us = shared.clock.lock().stamp(kind, to_micros(pts, frame.time_base));
            frame.pts = Some(rescale(out_us, Rational::MICROS, target));
            frame.duration = rescale(frame.duration, frame.time_base, target);
            frame.time_base = target;
        }
        None => frame.rescale_to(target),
    }
    frame
}

/// Move a batch of events from one producer channel into the graphs.
fn feed(input: &mut PumpInput, graphs: &mut [Option<FilterGraph>; 2]) -> bool {
    let mut progressed = false;
    for _ in 0..FEED_BATCH {
        let backed_up = MediaKind::ALL.into_iter().any(|k| {
            let idx = k.index();
            input.pads[idx].is_some()
                && graphs[idx].as_ref().is_some_and(|g| g.pending() >= MAX_PENDING)
        });
        if backed_up {
            break;
        }
        match input.receiver.try_recv() {
            Recv::Event(FrameEvent::Frame(frame)) => {
                progressed = true;
                let idx = frame.kind().index();
                match (graphs[idx].as_mut(), input.pads[idx]) {
                    (Some(graph), Some(pad)) => {
                        if let Err(err) = graph.push(pad, frame) {
                            warn!(error = %err, "Dispatcher pump: graph rejected frame");
                        }
                    }
                    _ => trace!("Dispatcher pump: no graph for frame, dropped"),
                }
            }
            Recv::Event(FrameEvent::Eos(kind)) => {
                progressed = true;
                end_input(input, graphs, kind);
            }
            Recv::Empty => break,
            Recv::Disconnected => {
                for kind in MediaKind::ALL {
                    end_input(input, graphs, kind);
                }
                break;
            }
        }
    }
    progressed
}

fn end_input(input: &PumpInput, graphs: &mut [Option<FilterGraph>; 2], kind: MediaKind) {
    let idx = kind.index();
    if let (Some(graph), Some(pad)) = (graphs[idx].as_mut(), input.pads[idx]) {
        if graph.input_ended(pad) {
            return;
        }
        if let Err(err) = graph.end_input(pad) {
            warn!(error = %err, kind = %kind, "Dispatcher pump: flushing graph failed");
        }
        debug!(kind = %kind, pad, "Dispatcher pump: input ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO: MediaKind = MediaKind::Video;
    const AUDIO: MediaKind = MediaKind::Audio;

    #[test]
    fn clock_is_frozen_while_paused() {
        let start = Instant::now();
        let mut clock = Clock {
            first_at: Some(start),
            ..Clock::default()
        };
        clock.paused_at = Some(start + Duration::from_millis(100));
        assert_eq!(
            clock.escaped(start + Duration::from_millis(500)),
            Duration::from_millis(100)
        );
        clock.paused_at = None;
        clock.offset = Duration::from_millis(400);
        assert_eq!(
            clock.escaped(start + Duration::from_millis(600)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn stamps_start_at_zero_and_skip_pauses() {
        let mut clock = Clock::default();
        assert_eq!(clock.stamp(VIDEO, 5_000_000), 0);
        assert_eq!(clock.stamp(VIDEO, 5_040_000), 40_000);
        clock.offset = Duration::from_millis(1000);
        assert_eq!(clock.stamp(VIDEO, 6_080_000), 80_000);
    }

    #[test]
    fn rebase_continues_from_last_output() {
        let mut clock = Clock::default();
        clock.stamp(VIDEO, 0);
        clock.stamp(VIDEO, 500_000);
        clock.rebase = true;
        // source jumped back to 100ms after a seek
        assert_eq!(clock.stamp(VIDEO, 100_000), 500_000);
        assert_eq!(clock.stamp(VIDEO, 140_000), 540_000);
    }

    #[test]
    fn rebase_after_a_pause_continues_from_last_output() {
        let mut clock = Clock::default();
        clock.stamp(VIDEO, 0);
        clock.stamp(VIDEO, 500_000);
        clock.offset = Duration::from_secs(1);
        assert_eq!(clock.stamp(VIDEO, 1_540_000), 540_000);

        clock.rebase = true;
        assert_eq!(clock.stamp(VIDEO, 100_000), 540_000);
        assert_eq!(clock.stamp(VIDEO, 140_000), 580_000);
        // a pause after the seek still only removes its own duration
        clock.offset = Duration::from_millis(1200);
        assert_eq!(clock.stamp(VIDEO, 380_000), 620_000);
    }

    #[test]
    fn output_never_runs_backwards_per_kind() {
        let mut clock = Clock::default();
        clock.stamp(VIDEO, 0);
        assert_eq!(clock.stamp(AUDIO, 80_000), 80_000);
        assert_eq!(clock.stamp(VIDEO, 100_000), 100_000);
        clock.rebase = true;
        // anchored at 100ms by video; an audio block from just before the
        // new position must not go behind the 80ms already sent
        assert_eq!(clock.stamp(VIDEO, 300_000), 100_000);
        assert_eq!(clock.stamp(AUDIO, 220_000), 80_000);
        assert_eq!(clock.stamp(AUDIO, 180_000), 80_000);
        assert_eq!(clock.stamp(AUDIO, 320_000), 120_000);
    }

    #[test]
    fn no_escaped_time_before_first_frame() {
        let clock = Clock::default();
        assert_eq!(clock.escaped(Instant::now()), Duration::ZERO);
    }
}
