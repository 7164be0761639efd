//! Change-notification timestamps.
//!
//! Stamps are wall-clock instants held at microsecond resolution so that a stamp
//! written into a sentinel mtime or a pub/sub payload reads back unchanged.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;

use crate::error::SyncError;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Monotonic-by-convention change stamp carried by every notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Stamp for the current wall-clock instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros())
    }

    /// Build a stamp from microseconds since the Unix epoch.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Microseconds since the Unix epoch.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Seconds since the Unix epoch as a real number.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Smallest stamp strictly greater than `self`.
    #[must_use]
    pub const fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Stamp for a local write: the current instant, or the successor of `last_seen`
    /// when the clock has not moved past it.
    #[must_use]
    pub fn next_after(last_seen: Self) -> Self {
        Self::now().max(last_seen.successor())
    }

    /// Truncate a filesystem time to a stamp.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self(i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)),
            Err(before) => {
                Self(-i64::try_from(before.duration().as_micros()).unwrap_or(i64::MAX))
            }
        }
    }

    /// Convert into a filesystem time.
    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let magnitude = Duration::from_micros(self.0.unsigned_abs());
        if self.0 >= 0 {
            UNIX_EPOCH + magnitude
        } else {
            UNIX_EPOCH - magnitude
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let seconds = magnitude / MICROS_PER_SECOND;
        let micros = magnitude % MICROS_PER_SECOND;
        write!(formatter, "{sign}{seconds}.{micros:06}")
    }
}

impl FromStr for Timestamp {
    type Err = SyncError;

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss
    )]
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidPayload {
            payload: value.to_string(),
        };
        let seconds: f64 = value.trim().parse().map_err(|_| invalid())?;
        if !seconds.is_finite() {
            return Err(invalid());
        }
        let micros = (seconds * 1_000_000.0).round();
        if micros.abs() >= i64::MAX as f64 {
            return Err(invalid());
        }
        Ok(Self(micros as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parses_back_exactly() {
        let stamp = Timestamp::from_micros(1_700_000_000_123_456);
        assert_eq!(stamp.to_string(), "1700000000.123456");
        assert_eq!("1700000000.123456".parse::<Timestamp>().ok(), Some(stamp));
    }

    #[test]
    fn parses_plain_real_numbers() {
        assert_eq!(
            "1450000000.5".parse::<Timestamp>().ok(),
            Some(Timestamp::from_micros(1_450_000_000_500_000))
        );
        assert_eq!(
            "42".parse::<Timestamp>().ok(),
            Some(Timestamp::from_micros(42_000_000))
        );
    }

    #[test]
    fn rejects_garbage_payloads() {
        assert!("not-a-stamp".parse::<Timestamp>().is_err());
        assert!("NaN".parse::<Timestamp>().is_err());
        assert!("inf".parse::<Timestamp>().is_err());
    }

    #[test]
    fn system_time_round_trip() {
        let stamp = Timestamp::from_micros(1_650_000_000_000_001);
        assert_eq!(Timestamp::from_system_time(stamp.to_system_time()), stamp);
    }

    #[test]
    fn next_after_is_strictly_greater() {
        let far_future = Timestamp::from_micros(i64::MAX / 2);
        assert_eq!(Timestamp::next_after(far_future), far_future.successor());
        let past = Timestamp::from_micros(1);
        assert!(Timestamp::next_after(past) > past);
    }

    #[test]
    fn negative_stamps_keep_their_sign() {
        let stamp = Timestamp::from_micros(-1_500_000);
        assert_eq!(stamp.to_string(), "-1.500000");
        assert_eq!(stamp.to_string().parse::<Timestamp>().ok(), Some(stamp));
    }
}
