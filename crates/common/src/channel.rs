//! Bounded frame channel between a decoder thread and whoever drains it.
//!
//! Producers never call back into the next stage. They push
//! [`FrameEvent`]s into a bounded `crossbeam` channel, so ordering and
//! back-pressure come from the channel instead of re-entrant callbacks.

use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, TryRecvError, TrySendError};

use crate::error::{MediaError, MediaResult};
use crate::frame::{Frame, MediaKind};

/// Item travelling through a frame channel.
#[derive(Debug)]
pub enum FrameEvent {
    Frame(Frame),
    /// No more frames of this kind until the next seek.
    Eos(MediaKind),
}

/// Result of a non-blocking receive.
#[derive(Debug)]
pub enum Recv {
    Event(FrameEvent),
    Empty,
    Disconnected,
}

/// Create a channel holding at most `capacity` events.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Sending half, held by a producer.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: channel::Sender<FrameEvent>,
}

impl FrameSender {
    /// Blocking send. Fails with [`MediaError::Stopped`] once the receiver
    /// is gone.
    pub fn send(&self, frame: Frame) -> MediaResult<()> {
        self.tx
            .send(FrameEvent::Frame(frame))
            .map_err(|_| MediaError::Stopped)
    }

    /// Send, giving the frame back if the channel stays full for `timeout`.
    /// Producer threads use this so they can notice their own stop flag.
    pub fn send_timeout(&self, frame: Frame, timeout: Duration) -> Result<(), SendFailure> {
        match self.tx.send_timeout(FrameEvent::Frame(frame), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(FrameEvent::Frame(f))) => Err(SendFailure::Full(f)),
            Err(_) => Err(SendFailure::Disconnected),
        }
    }

    pub fn try_send(&self, frame: Frame) -> Result<(), SendFailure> {
        match self.tx.try_send(FrameEvent::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(FrameEvent::Frame(f))) => Err(SendFailure::Full(f)),
            Err(_) => Err(SendFailure::Disconnected),
        }
    }

    /// Signal end of stream for one kind.
    pub fn send_eos(&self, kind: MediaKind) -> MediaResult<()> {
        self.tx
            .send(FrameEvent::Eos(kind))
            .map_err(|_| MediaError::Stopped)
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

/// Why a timed or non-blocking send failed.
#[derive(Debug)]
pub enum SendFailure {
    /// Channel full; the frame is handed back for a retry.
    Full(Frame),
    Disconnected,
}

/// Receiving half, drained by the dispatcher or the player.
#[derive(Clone, Debug)]
pub struct FrameReceiver {
    rx: channel::Receiver<FrameEvent>,
}

impl FrameReceiver {
    pub fn try_recv(&self) -> Recv {
        match self.rx.try_recv() {
            Ok(ev) => Recv::Event(ev),
            Err(TryRecvError::Empty) => Recv::Empty,
            Err(TryRecvError::Disconnected) => Recv::Disconnected,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Recv {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Recv::Event(ev),
            Err(RecvTimeoutError::Timeout) => Recv::Empty,
            Err(RecvTimeoutError::Disconnected) => Recv::Disconnected,
        }
    }

    /// Block until an event can be received or the senders are gone,
    /// without taking it. `false` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut select = channel::Select::new();
        select.recv(&self.rx);
        select.ready_timeout(timeout).is_ok()
    }

    /// Discard everything currently queued. Used after a seek.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, Frame};
    use crate::types::Rational;

    fn audio(pts: i64) -> Frame {
        Frame::audio(
            AudioFrame::silence(8000, 1, 80),
            Some(pts),
            Rational::new(1, 8000),
        )
    }

    #[test]
    fn preserves_order_and_eos() {
        let (tx, rx) = frame_channel(4);
        tx.send(audio(0)).unwrap();
        tx.send(audio(80)).unwrap();
        tx.send_eos(MediaKind::Audio).unwrap();

        let mut seen = Vec::new();
        while let Recv::Event(ev) = rx.try_recv() {
            seen.push(match ev {
                FrameEvent::Frame(f) => f.pts,
                FrameEvent::Eos(_) => None,
            });
        }
        assert_eq!(seen, vec![Some(0), Some(80), None]);
    }

    #[test]
    fn full_channel_hands_frame_back() {
        let (tx, _rx) = frame_channel(1);
        tx.try_send(audio(0)).unwrap();
        assert!(tx.is_full());
        match tx.send_timeout(audio(80), Duration::from_millis(5)) {
            Err(SendFailure::Full(f)) => assert_eq!(f.pts, Some(80)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropped_receiver_disconnects() {
        let (tx, rx) = frame_channel(1);
        drop(rx);
        assert!(matches!(tx.send(audio(0)), Err(MediaError::Stopped)));
    }

    #[test]
    fn wait_ready_leaves_the_event_queued() {
        let (tx, rx) = frame_channel(2);
        assert!(!rx.wait_ready(Duration::from_millis(5)));
        tx.send(audio(0)).unwrap();
        assert!(rx.wait_ready(Duration::from_millis(5)));
        assert_eq!(rx.len(), 1);
        drop(tx);
        assert!(matches!(rx.try_recv(), Recv::Event(_)));
        assert!(rx.wait_ready(Duration::from_millis(5)));
        assert!(matches!(rx.try_recv(), Recv::Disconnected));
    }

    #[test]
    fn drain_empties() {
        let (tx, rx) = frame_channel(8);
        for i in 0..5 {
            tx.send(audio(i * 80)).unwrap();
        }
        assert_eq!(rx.drain(), 5);
        assert!(matches!(rx.try_recv(), Recv::Empty));
    }
}
