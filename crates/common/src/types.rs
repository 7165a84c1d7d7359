//! Rational time bases and timestamp arithmetic.
//!
//! Every timestamp in the engine is an integer count in some [`Rational`]
//! time base. Comparing two counts is only meaningful after [`rescale`]-ing
//! them into a common base.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for "no presentation timestamp".
pub const NOPTS: i64 = i64::MIN;

/// Rational number (`num / den`) used for time bases, frame rates and speeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// One nanosecond per tick. The Timeline runs in this base.
    pub const NANOS: Self = Self {
        num: 1,
        den: 1_000_000_000,
    };
    /// One microsecond per tick.
    pub const MICROS: Self = Self {
        num: 1,
        den: 1_000_000,
    };
    /// One millisecond per tick. Matroska's default timecode scale.
    pub const MILLIS: Self = Self { num: 1, den: 1000 };

    pub const FPS_25: Self = Self { num: 25, den: 1 };
    pub const FPS_30: Self = Self { num: 30, den: 1 };
    pub const FPS_60: Self = Self { num: 60, den: 1 };
    pub const FPS_29_97: Self = Self {
        num: 30000,
        den: 1001,
    };

    /// Build a rational, normalising the sign onto the numerator.
    ///
    /// # Panics
    ///
    /// Panics if `den` is zero.
    pub fn new(num: i32, den: i32) -> Self {
        assert!(den != 0, "Rational denominator must be non-zero");
        if den < 0 {
            Self {
                num: -num,
                den: -den,
            }
        } else {
            Self { num, den }
        }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// `den / num`. Turns a frame rate into a frame duration time base.
    ///
    /// # Panics
    ///
    /// Panics if `num` is zero. Use [`checked_invert`](Self::checked_invert)
    /// for rates that have not been validated.
    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }

    /// `den / num`, or `None` for a zero numerator.
    pub fn checked_invert(self) -> Option<Self> {
        (self.num != 0).then(|| Self::new(self.den, self.num))
    }

    /// A rational is usable as a time base only when both terms are positive.
    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Reduce to lowest terms.
    pub fn reduce(self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i32;
        Self {
            num: self.num / g,
            den: self.den / g,
        }
    }

    /// Parse `"30"`, `"30000/1001"` or `"30000:1001"`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (n, d) = match s.split_once(|c: char| c == '/' || c == ':') {
            Some((n, d)) => (n.trim().parse::<i32>().ok()?, d.trim().parse::<i32>().ok()?),
            None => (s.parse::<i32>().ok()?, 1),
        };
        if d == 0 {
            return None;
        }
        Some(Self::new(n, d))
    }

    /// Convert `value` from this time base into `to`.
    pub fn rescale(self, value: i64, to: Rational) -> i64 {
        rescale(value, self, to)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MICROS
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Integer division rounding half away from zero.
fn div_round(n: i128, d: i128) -> i128 {
    let (n, d) = if d < 0 { (-n, -d) } else { (n, d) };
    if n >= 0 {
        (n + d / 2) / d
    } else {
        (n - d / 2) / d
    }
}

/// Rescale a timestamp count from one time base to another.
///
/// Uses a 128-bit intermediate so `value * from.num * to.den` cannot
/// overflow. [`NOPTS`] passes through unchanged; a degenerate target base
/// also yields [`NOPTS`].
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if value == NOPTS || to.num == 0 || from.den == 0 {
        return NOPTS;
    }
    if from == to {
        return value;
    }
    let n = value as i128 * from.num as i128 * to.den as i128;
    let d = from.den as i128 * to.num as i128;
    let q = div_round(n, d);
    q.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

/// Convert a timestamp count to microseconds.
pub fn to_micros(value: i64, time_base: Rational) -> i64 {
    rescale(value, time_base, Rational::MICROS)
}

/// Convert a timestamp count to nanoseconds.
pub fn to_nanos(value: i64, time_base: Rational) -> i64 {
    rescale(value, time_base, Rational::NANOS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_between_bases() {
        let tb_90k = Rational::new(1, 90_000);
        assert_eq!(rescale(90_000, tb_90k, Rational::MILLIS), 1000);
        assert_eq!(rescale(1, Rational::FPS_30.invert(), Rational::MICROS), 33_333);
        assert_eq!(rescale(2, Rational::FPS_30.invert(), Rational::MICROS), 66_667);
    }

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        let half = Rational::new(1, 2);
        assert_eq!(rescale(1, half, Rational::new(1, 1)), 1);
        assert_eq!(rescale(-1, half, Rational::new(1, 1)), -1);
        assert_eq!(rescale(-3, Rational::new(1, 4), Rational::new(1, 1)), -1);
    }

    #[test]
    fn nopts_passes_through() {
        assert_eq!(rescale(NOPTS, Rational::MILLIS, Rational::NANOS), NOPTS);
    }

    #[test]
    fn large_values_do_not_overflow() {
        let hours = 24 * 3600 * 1_000_000_000i64;
        assert_eq!(rescale(hours, Rational::NANOS, Rational::NANOS), hours);
        assert_eq!(
            rescale(hours, Rational::NANOS, Rational::new(1, 90_000)),
            24 * 3600 * 90_000
        );
    }

    #[test]
    fn parse_forms() {
        assert_eq!(Rational::parse("30"), Some(Rational::new(30, 1)));
        assert_eq!(Rational::parse("30000/1001"), Some(Rational::FPS_29_97));
        assert_eq!(Rational::parse("1:25"), Some(Rational::new(1, 25)));
        assert_eq!(Rational::parse("1/0"), None);
        assert_eq!(Rational::parse("abc"), None);
    }

    #[test]
    fn negative_denominator_normalised() {
        let r = Rational::new(1, -2);
        assert_eq!(r, Rational { num: -1, den: 2 });
        assert!(!r.is_valid());
    }

    #[test]
    fn reduce_and_display() {
        assert_eq!(Rational::new(60, 2).reduce(), Rational::new(30, 1));
        assert_eq!(format!("{}", Rational::FPS_29_97), "30000/1001");
    }

    #[test]
    fn invert_frame_rates() {
        assert_eq!(Rational::FPS_25.invert(), Rational::new(1, 25));
        assert_eq!(Rational::new(-30, 1).checked_invert(), Some(Rational::new(-1, 30)));
        assert_eq!(Rational::new(0, 1).checked_invert(), None);
    }

    #[test]
    #[should_panic(expected = "denominator")]
    fn inverting_zero_panics() {
        let _ = Rational::new(0, 1).invert();
    }

    #[test]
    #[should_panic(expected = "denominator")]
    fn zero_denominator_panics() {
        let _ = Rational::new(1, 0);
    }
}
