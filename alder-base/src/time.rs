//! Wall-clock time values with microsecond resolution.
//!
//! A [`Time`] is a signed `(sec, usec)` pair. The canonical form keeps
//! `0 <= usec < 1_000_000`; a negative value carries its sign in `sec`
//! unless `sec` is zero, in which case the sign lives in `usec`.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const USEC_PER_SEC: i64 = 1_000_000;

/// Values with `sec` below this bound are durations, not absolute times.
const ABSOLUTE_CUTOFF: i64 = 1_000_000_000;

/// A point in time or a signed duration, in seconds and microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Time {
    pub sec: i64,
    pub usec: i32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, usec: 0 };

    pub fn new(sec: i64, usec: i32) -> Self {
        let mut t = Time { sec, usec };
        t.adjust();
        t
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Time {
                sec: d.as_secs() as i64,
                usec: d.subsec_micros() as i32,
            },
            Err(e) => crate::fatal("gettimeofday", e),
        }
    }

    pub fn from_secs(sec: i64) -> Self {
        Time { sec, usec: 0 }
    }

    pub fn from_millis(ms: i64) -> Self {
        Time::new(ms / 1000, ((ms % 1000) * 1000) as i32)
    }

    /// Normalize into canonical form, carrying usec overflow into sec.
    pub fn adjust(&mut self) {
        let usec = i64::from(self.usec);
        if usec < 0 && self.sec > 0 {
            self.sec += usec / USEC_PER_SEC - 1;
            self.usec = (usec % USEC_PER_SEC + USEC_PER_SEC) as i32;
        } else if usec >= USEC_PER_SEC {
            self.sec += usec / USEC_PER_SEC;
            self.usec = (usec % USEC_PER_SEC) as i32;
        }
    }

    /// Signed difference `t1 - t0` plus its sign as an [`Ordering`].
    ///
    /// Both operands may be non-canonical or negative; the four sign
    /// combinations are reduced to one addition or subtraction of
    /// magnitudes with the sign restored afterwards.
    pub fn diff(t1: Time, t0: Time) -> (Time, Ordering) {
        let (t0m, t0pos) = t0.magnitude();
        let (t1m, t1pos) = t1.magnitude();

        let mut out;
        let negative;
        match (t1pos, t0pos) {
            (true, true) => {
                negative = t1m.lex_less(t0m);
                out = if negative {
                    Time::sub_magnitudes(t0m, t1m)
                } else {
                    Time::sub_magnitudes(t1m, t0m)
                };
            }
            (true, false) => {
                negative = false;
                out = Time::add_magnitudes(t1m, t0m);
            }
            (false, true) => {
                negative = true;
                out = Time::add_magnitudes(t1m, t0m);
            }
            (false, false) => {
                negative = t0m.lex_less(t1m);
                out = if negative {
                    Time::sub_magnitudes(t1m, t0m)
                } else {
                    Time::sub_magnitudes(t0m, t1m)
                };
            }
        }

        if negative {
            if out.sec == 0 {
                out.usec = -out.usec;
            } else {
                out.sec = -out.sec;
            }
        }
        out.adjust();

        let sign = if out.sec < 0 || (out.sec == 0 && out.usec < 0) {
            Ordering::Less
        } else if out.sec == 0 && out.usec == 0 {
            Ordering::Equal
        } else {
            Ordering::Greater
        };
        (out, sign)
    }

    /// Add a nonnegative increment. Negative input is ignored with a
    /// diagnostic.
    pub fn incr(&mut self, sec: i64, usec: i64) {
        if sec < 0 || usec < 0 {
            tracing::warn!(sec, usec, "ignoring negative time increment");
            return;
        }
        self.sec += sec;
        self.usec = (i64::from(self.usec) + usec % USEC_PER_SEC) as i32;
        self.sec += usec / USEC_PER_SEC;
        self.adjust();
    }

    /// Interpret as a deadline: durations are added to the current time,
    /// large values are already absolute.
    pub fn to_absolute(self) -> Time {
        if self.sec < ABSOLUTE_CUTOFF {
            let mut abs = Time::now();
            abs.incr(self.sec, i64::from(self.usec));
            abs
        } else {
            self
        }
    }

    /// Inverse of [`Time::to_absolute`]: absolute values become an offset
    /// from the current time, small values are already relative.
    pub fn to_relative(self) -> Time {
        if self.sec > ABSOLUTE_CUTOFF {
            let (rel, _) = Time::diff(self, Time::now());
            rel
        } else {
            self
        }
    }

    /// Milliseconds, with the guarantee that a nonzero time never
    /// collapses to zero.
    pub fn as_millis(&self) -> i64 {
        let mut result = if self.sec >= 0 {
            self.sec * 1000 + i64::from(self.usec) / 1000
        } else {
            self.sec * 1000 - i64::from(self.usec) / 1000
        };
        if result == 0 && self.sec == 0 && self.usec != 0 {
            result = 1;
        }
        result
    }

    /// Nonnegative duration for timed waits; negative values clamp to zero.
    pub fn as_duration(&self) -> Duration {
        if self.sec < 0 || (self.sec == 0 && self.usec < 0) {
            Duration::ZERO
        } else {
            Duration::new(self.sec as u64, (self.usec as u32) * 1000)
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Time {
            sec: d.as_secs() as i64,
            usec: d.subsec_micros() as i32,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    fn magnitude(self) -> (Time, bool) {
        if self.sec < 0 {
            (
                Time {
                    sec: -self.sec,
                    usec: self.usec,
                },
                false,
            )
        } else if self.sec == 0 && self.usec < 0 {
            (
                Time {
                    sec: 0,
                    usec: -self.usec,
                },
                false,
            )
        } else {
            (self, true)
        }
    }

    fn lex_less(self, other: Time) -> bool {
        self.sec < other.sec || (self.sec == other.sec && self.usec < other.usec)
    }

    fn add_magnitudes(a: Time, b: Time) -> Time {
        Time {
            sec: a.sec + b.sec,
            usec: a.usec + b.usec,
        }
    }

    // Caller guarantees a >= b lexicographically.
    fn sub_magnitudes(a: Time, b: Time) -> Time {
        if a.usec >= b.usec {
            Time {
                sec: a.sec - b.sec,
                usec: a.usec - b.usec,
            }
        } else {
            Time {
                sec: a.sec - b.sec - 1,
                usec: 1_000_000 + a.usec - b.usec,
            }
        }
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        Time::diff(*self, *other).1
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sec == 0 && self.usec < 0 {
            write!(f, "-0:{:06}", -self.usec)
        } else {
            write!(f, "{}:{:06}", self.sec, self.usec)
        }
    }
}
