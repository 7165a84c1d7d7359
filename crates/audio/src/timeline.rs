//! Shared playback clock.
//!
//! The audio pull callback is the only writer in steady state: every time
//! the render device asks for samples it anchors the [`Timeline`] to the
//! presentation time of what is about to be heard. The video pacing loop
//! only reads it. Between anchors the value is extrapolated from the anchor
//! instant, scaled by the playback speed, and frozen while paused.
//!
//! Values are nanoseconds of media time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use capline_common::NOPTS;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug)]
struct Anchor {
    value_ns: i64,
    at: Instant,
}

struct Inner {
    anchor: Mutex<Anchor>,
    /// Speed multiplier stored as f64 bits.
    speed_bits: AtomicU64,
    paused: AtomicBool,
}

/// Cheap-to-clone handle on one playback clock.
#[derive(Clone)]
pub struct Timeline {
    inner: Arc<Inner>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// Unset clock at speed 1.0, not paused.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                anchor: Mutex::new(Anchor {
                    value_ns: NOPTS,
                    at: Instant::now(),
                }),
                speed_bits: AtomicU64::new(1.0f64.to_bits()),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Anchor the clock: at instant `at` the position is `value_ns`.
    pub fn set(&self, value_ns: i64, at: Instant) {
        *self.inner.anchor.lock() = Anchor { value_ns, at };
    }

    /// Anchored value without extrapolation.
    pub fn get(&self) -> Option<i64> {
        let value = self.inner.anchor.lock().value_ns;
        (value != NOPTS).then_some(value)
    }

    /// Current position.
    pub fn now(&self) -> Option<i64> {
        self.at(Instant::now())
    }

    /// Position at an arbitrary instant (which may precede the anchor).
    pub fn at(&self, instant: Instant) -> Option<i64> {
        let anchor = *self.inner.anchor.lock();
        self.project(anchor, instant)
    }

    fn project(&self, anchor: Anchor, instant: Instant) -> Option<i64> {
        if anchor.value_ns == NOPTS {
            return None;
        }
        if self.is_paused() {
            return Some(anchor.value_ns);
        }
        let speed = self.speed();
        let elapsed_ns = match instant.checked_duration_since(anchor.at) {
            Some(d) => d.as_nanos() as f64,
            None => -(anchor.at.duration_since(instant).as_nanos() as f64),
        };
        Some(anchor.value_ns.saturating_add((elapsed_ns * speed) as i64))
    }

    /// Freeze the position.
    pub fn pause(&self) {
        let mut anchor = self.inner.anchor.lock();
        let now = Instant::now();
        if let Some(value_ns) = self.project(*anchor, now) {
            *anchor = Anchor { value_ns, at: now };
        }
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Continue advancing from the frozen position.
    pub fn resume(&self) {
        let mut anchor = self.inner.anchor.lock();
        anchor.at = Instant::now();
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.inner.speed_bits.load(Ordering::Acquire))
    }

    /// Change the rate. The current position is re-anchored first so the
    /// clock does not jump.
    pub fn set_speed(&self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) {
            return;
        }
        let mut anchor = self.inner.anchor.lock();
        let now = Instant::now();
        if let Some(value_ns) = self.project(*anchor, now) {
            *anchor = Anchor { value_ns, at: now };
        }
        self.inner.speed_bits.store(speed.to_bits(), Ordering::Release);
    }

    /// Back to "unset". Speed and pause state are kept.
    pub fn reset(&self) {
        self.inner.anchor.lock().value_ns = NOPTS;
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("value_ns", &self.get())
            .field("speed", &self.speed())
            .field("paused", &self.is_paused())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_unset() {
        let tl = Timeline::new();
        assert!(!tl.is_set());
        assert_eq!(tl.now(), None);
        assert!((tl.speed() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extrapolates_from_anchor() {
        let tl = Timeline::new();
        let t0 = Instant::now();
        tl.set(1_000_000_000, t0);
        assert_eq!(tl.at(t0 + Duration::from_millis(250)), Some(1_250_000_000));
        // anchors in the future (device latency) project backwards
        assert_eq!(tl.at(t0 - Duration::from_millis(100)), Some(900_000_000));
    }

    #[test]
    fn speed_scales_progress() {
        let tl = Timeline::new();
        tl.set_speed(2.0);
        let t0 = Instant::now();
        tl.set(0, t0);
        assert_eq!(tl.at(t0 + Duration::from_millis(100)), Some(200_000_000));
    }

    #[test]
    fn invalid_speed_is_ignored() {
        let tl = Timeline::new();
        tl.set_speed(0.0);
        tl.set_speed(f64::NAN);
        assert!((tl.speed() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn paused_clock_is_frozen() {
        let tl = Timeline::new();
        tl.set(5_000, Instant::now());
        tl.pause();
        let frozen = tl.now().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tl.now(), Some(frozen));

        tl.resume();
        std::thread::sleep(Duration::from_millis(20));
        let after = tl.now().unwrap();
        assert!(after >= frozen + 15_000_000);
        // resuming does not include the paused interval
        assert!(after < frozen + 200_000_000);
    }

    #[test]
    fn reset_unsets_but_clones_share_state() {
        let tl = Timeline::new();
        let other = tl.clone();
        tl.set(42, Instant::now());
        assert!(other.is_set());
        other.reset();
        assert!(!tl.is_set());
    }
}
