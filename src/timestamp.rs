//! Microsecond-resolution wall clock time.

use std::{
    fmt,
    ops::Add,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A point in time, stored as microseconds since the Unix epoch.
///
/// `Timestamp` is a plain `Copy` value ordered by its microsecond count. The
/// zero value doubles as the "invalid" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MICROS_PER_SECOND: i64 = 1_000_000;

    pub const fn new(micros_since_epoch: i64) -> Self {
        Self(micros_since_epoch)
    }

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self(micros)
    }

    pub const fn invalid() -> Self {
        Self(0)
    }

    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub const fn from_unix_time(secs: i64, micros: i64) -> Self {
        Self(secs * Self::MICROS_PER_SECOND + micros)
    }

    pub const fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    pub const fn secs_since_epoch(&self) -> i64 {
        self.0 / Self::MICROS_PER_SECOND
    }

    /// Returns a timestamp `seconds` later (or earlier, if negative).
    pub fn add_seconds(self, seconds: f64) -> Self {
        let delta = (seconds * Self::MICROS_PER_SECOND as f64) as i64;
        Self(self.0 + delta)
    }

    pub const fn add_micros(self, micros: i64) -> Self {
        Self(self.0 + micros)
    }

    /// Difference `high - low` in seconds.
    pub fn time_diff(high: Timestamp, low: Timestamp) -> f64 {
        (high.0 - low.0) as f64 / Self::MICROS_PER_SECOND as f64
    }

    /// Formats as `YYYYMMDD HH:MM:SS[.uuuuuu]` in UTC.
    pub fn to_formatted_string(&self, show_micros: bool) -> String {
        let seconds = self.secs_since_epoch() as libc::time_t;
        // SAFETY: `tm` is plain data and gmtime_r only writes into it.
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        unsafe {
            libc::gmtime_r(&seconds, &mut tm);
        }
        let date = format!(
            "{:4}{:02}{:02} {:02}:{:02}:{:02}",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec
        );
        if show_micros {
            format!("{}.{:06}", date, self.0 % Self::MICROS_PER_SECOND)
        } else {
            date
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / Self::MICROS_PER_SECOND,
            self.0 % Self::MICROS_PER_SECOND
        )
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}
