//! Composite end-of-stream state.
//!
//! Video, audio and the audio FIFO each finish on their own schedule. The
//! encoder only counts as done once every bit is set. Paths that were never
//! opened start with their bits already set.

use std::sync::atomic::{AtomicU8, Ordering};

pub const EOF_VIDEO: u8 = 1;
pub const EOF_AUDIO: u8 = 1 << 1;
pub const EOF_AUDIO_FIFO: u8 = 1 << 2;
pub const EOF_ALL: u8 = EOF_VIDEO | EOF_AUDIO | EOF_AUDIO_FIFO;

#[derive(Debug, Default)]
pub struct EofState {
    bits: AtomicU8,
}

impl EofState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `bits`. Returns `true` if this call completed the mask.
    pub fn set(&self, bits: u8) -> bool {
        let before = self.bits.fetch_or(bits & EOF_ALL, Ordering::AcqRel);
        before != EOF_ALL && (before | bits) & EOF_ALL == EOF_ALL
    }

    pub fn is_set(&self, bits: u8) -> bool {
        self.bits.load(Ordering::Acquire) & bits == bits
    }

    pub fn bits(&self) -> u8 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.bits() == EOF_ALL
    }

    pub fn clear(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_only_after_the_last_bit() {
        for order in [
            [EOF_VIDEO, EOF_AUDIO, EOF_AUDIO_FIFO],
            [EOF_AUDIO_FIFO, EOF_VIDEO, EOF_AUDIO],
            [EOF_AUDIO, EOF_AUDIO_FIFO, EOF_VIDEO],
        ] {
            let eof = EofState::new();
            assert!(!eof.set(order[0]));
            assert!(!eof.is_complete());
            assert!(!eof.set(order[1]));
            assert!(!eof.is_complete());
            assert!(eof.set(order[2]));
            assert!(eof.is_complete());
        }
    }

    #[test]
    fn completing_twice_reports_once() {
        let eof = EofState::new();
        assert!(eof.set(EOF_ALL));
        assert!(!eof.set(EOF_VIDEO));
        assert!(eof.is_set(EOF_AUDIO | EOF_AUDIO_FIFO));
        eof.clear();
        assert_eq!(eof.bits(), 0);
    }
}
