//! Producer/Consumer contract shared by decoders, the dispatcher, the
//! encoder and renderers.
//!
//! ```text
//!  Producer ──FrameSender──▶ Dispatcher ──consume()──▶ Consumer
//!  (Decoder)                 (graph pump)               (Encoder | Renderer)
//! ```
//!
//! Both traits take `&self` so one instance can be shared between the
//! control thread and the stage's own worker thread behind an `Arc`.

use crate::channel::FrameSender;
use crate::error::MediaResult;
use crate::frame::{Frame, MediaKind, StreamFormat};

/// Variant tag for pipeline stages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Decoder,
    Encoder,
    Renderer,
}

/// Source of decoded frames.
pub trait Producer: Send + Sync {
    fn role(&self) -> Role {
        Role::Decoder
    }

    /// Whether the source carries a stream of this kind.
    fn has(&self, kind: MediaKind) -> bool;

    /// Description of the stream for `kind`, if present.
    fn format(&self, kind: MediaKind) -> Option<StreamFormat>;

    /// Where decoded frames go. Must be called before [`start`](Self::start).
    fn set_sink(&self, sink: FrameSender);

    /// Begin producing on the producer's own thread.
    fn start(&self) -> MediaResult<()>;

    /// Stop producing and join the producer thread. Idempotent.
    fn stop(&self);

    /// Reposition the source. `position_us` is absolute; `delta_us` hints
    /// the direction of a relative seek (0 for absolute).
    fn seek(&self, position_us: i64, delta_us: i64) -> MediaResult<()>;

    /// End of stream reached for `kind`.
    fn eof(&self, kind: MediaKind) -> bool;

    /// End of stream reached for every kind the source carries.
    fn eof_all(&self) -> bool {
        MediaKind::ALL
            .into_iter()
            .filter(|k| self.has(*k))
            .all(|k| self.eof(k))
    }

    fn is_running(&self) -> bool;

    /// Live sources (screen/microphone capture) cannot seek and never end.
    fn is_live(&self) -> bool {
        false
    }

    /// Total duration in microseconds, if known.
    fn duration_us(&self) -> Option<i64> {
        None
    }
}

/// Sink for frames coming out of the processing graph.
///
/// Callers are expected to check [`full`](Self::full) before
/// [`consume`](Self::consume); a consume on a full buffer drops the frame.
pub trait Consumer: Send + Sync {
    fn role(&self) -> Role;

    /// Start the consumer's worker.
    fn run(&self) -> MediaResult<()>;

    /// Hand over a frame. Returns `false` if it was dropped.
    fn consume(&self, frame: Frame, kind: MediaKind) -> bool;

    /// Whether the buffer for `kind` has no free slot.
    fn full(&self, kind: MediaKind) -> bool;

    /// Whether frames of `kind` are admitted at all.
    fn accepts(&self, kind: MediaKind) -> bool;

    fn enable(&self, kind: MediaKind, enabled: bool);

    /// Format the consumer wants to receive for `kind`.
    fn format(&self, kind: MediaKind) -> Option<StreamFormat>;

    /// No more frames of `kind` will arrive.
    fn notify_eos(&self, kind: MediaKind);

    fn pause(&self);

    fn resume(&self);

    /// Stop the worker and release resources. Idempotent.
    fn stop(&self);

    /// Every enabled path has drained.
    fn eof(&self) -> bool;

    /// Opened and able to accept frames.
    fn ready(&self) -> bool;

    /// Block until the worker thread has exited.
    fn wait(&self);
}
