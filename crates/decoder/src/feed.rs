//! Producer fed by an external decoder.
//!
//! Demuxing and codec decode happen outside the engine. The decoder thread
//! owns a [`FeedHandle`] and pushes decoded frames into it; the engine sees
//! a [`FeedSource`] implementing [`Producer`]. Frames travel over the
//! bounded frame channel, so a slow consumer back-pressures the decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capline_common::{
    Frame, FrameSender, MediaError, MediaKind, MediaResult, Producer, StreamFormat,
};
use parking_lot::Mutex;
use tracing::debug;

type SeekHandler = Box<dyn FnMut(i64, i64) -> MediaResult<()> + Send>;

struct FeedShared {
    formats: [Option<StreamFormat>; 2],
    live: bool,
    running: AtomicBool,
    eof: [AtomicBool; 2],
    sink: Mutex<Option<FrameSender>>,
    on_seek: Mutex<Option<SeekHandler>>,
}

/// Engine-facing half.
pub struct FeedSource {
    shared: Arc<FeedShared>,
}

/// Decoder-facing half.
#[derive(Clone)]
pub struct FeedHandle {
    shared: Arc<FeedShared>,
}

impl FeedSource {
    /// Build a source carrying the given streams (at most one per kind).
    pub fn new(streams: impl IntoIterator<Item = StreamFormat>, live: bool) -> (Self, FeedHandle) {
        let mut formats: [Option<StreamFormat>; 2] = [None, None];
        for fmt in streams {
            let idx = fmt.kind().index();
            formats[idx] = Some(fmt);
        }
        let shared = Arc::new(FeedShared {
            formats,
            live,
            running: AtomicBool::new(false),
            eof: [AtomicBool::new(false), AtomicBool::new(false)],
            sink: Mutex::new(None),
            on_seek: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            FeedHandle { shared },
        )
    }

    /// Called from [`Producer::seek`] so the external decoder can reposition.
    pub fn on_seek(&self, handler: impl FnMut(i64, i64) -> MediaResult<()> + Send + 'static) {
        *self.shared.on_seek.lock() = Some(Box::new(handler));
    }
}

impl FeedHandle {
    /// Push one decoded frame, blocking while the channel is full.
    pub fn push(&self, frame: Frame) -> MediaResult<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(MediaError::Stopped);
        }
        let kind = frame.kind();
        if self.shared.formats[kind.index()].is_none() {
            return Err(MediaError::InvalidArgument(format!(
                "source has no {kind} stream"
            )));
        }
        let sink = self.shared.sink.lock().clone().ok_or(MediaError::Stopped)?;
        sink.send(frame)
    }

    /// Mark the end of one stream.
    pub fn finish(&self, kind: MediaKind) -> MediaResult<()> {
        self.shared.eof[kind.index()].store(true, Ordering::Release);
        let sink = self.shared.sink.lock().clone().ok_or(MediaError::Stopped)?;
        sink.send_eos(kind)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Producer for FeedSource {
    fn has(&self, kind: MediaKind) -> bool {
        self.shared.formats[kind.index()].is_some()
    }

    fn format(&self, kind: MediaKind) -> Option<StreamFormat> {
        self.shared.formats[kind.index()].clone()
    }

    fn set_sink(&self, sink: FrameSender) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn start(&self) -> MediaResult<()> {
        if self.shared.sink.lock().is_none() {
            return Err(MediaError::NotReady("feed has no frame sink".into()));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(MediaError::AlreadyRunning);
        }
        debug!("Feed source started");
        Ok(())
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    fn seek(&self, position_us: i64, delta_us: i64) -> MediaResult<()> {
        if self.shared.live {
            return Err(MediaError::InvalidArgument("live source cannot seek".into()));
        }
        let mut handler = self.shared.on_seek.lock();
        let handler = handler
            .as_mut()
            .ok_or_else(|| MediaError::InvalidArgument("source is not seekable".into()))?;
        handler(position_us, delta_us)?;
        for flag in &self.shared.eof {
            flag.store(false, Ordering::Release);
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
        self.shared.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::{frame_channel, AudioFrame, FrameEvent, Rational, Recv};
    use std::sync::atomic::AtomicI64;

    fn audio_format() -> StreamFormat {
        StreamFormat::Audio {
            sample_rate: 8000,
            channels: 1,
            time_base: Rational::new(1, 8000),
        }
    }

    fn block(pts: i64) -> Frame {
        Frame::audio(AudioFrame::silence(8000, 1, 160), Some(pts), Rational::new(1, 8000))
    }

    #[test]
    fn push_requires_start() {
        let (src, feed) = FeedSource::new([audio_format()], false);
        let (tx, rx) = frame_channel(2);
        src.set_sink(tx);
        assert!(matches!(feed.push(block(0)), Err(MediaError::Stopped)));

        src.start().unwrap();
        feed.push(block(0)).unwrap();
        feed.finish(MediaKind::Audio).unwrap();
        assert!(matches!(rx.try_recv(), Recv::Event(FrameEvent::Frame(_))));
        assert!(matches!(
            rx.try_recv(),
            Recv::Event(FrameEvent::Eos(MediaKind::Audio))
        ));
        assert!(src.eof_all());
    }

    #[test]
    fn rejects_frames_for_missing_stream() {
        let (src, feed) = FeedSource::new([audio_format()], false);
        let (tx, _rx) = frame_channel(2);
        src.set_sink(tx);
        src.start().unwrap();
        let video = Frame::video(
            capline_common::VideoFrame::new(capline_common::PixelFormat::Gray8, 2, 2),
            Some(0),
            Rational::MILLIS,
        );
        assert!(matches!(
            feed.push(video),
            Err(MediaError::InvalidArgument(_))
        ));
        assert!(!src.has(MediaKind::Video));
    }

    #[test]
    fn seek_calls_handler_and_clears_eof() {
        let (src, feed) = FeedSource::new([audio_format()], false);
        let (tx, _rx) = frame_channel(4);
        src.set_sink(tx);
        src.start().unwrap();
        assert!(matches!(src.seek(0, 0), Err(MediaError::InvalidArgument(_))));

        let target = Arc::new(AtomicI64::new(-1));
        let t = Arc::clone(&target);
        src.on_seek(move |pos, _| {
            t.store(pos, Ordering::SeqCst);
            Ok(())
        });
        feed.finish(MediaKind::Audio).unwrap();
        src.seek(1_500_000, 0).unwrap();
        assert_eq!(target.load(Ordering::SeqCst), 1_500_000);
        assert!(!src.eof(MediaKind::Audio));
    }

    #[test]
    fn live_feed_cannot_seek() {
        let (src, _feed) = FeedSource::new([audio_format()], true);
        assert!(src.is_live());
        assert!(src.seek(0, 0).is_err());
    }
}
