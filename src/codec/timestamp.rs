//! Timestamp extension (type −1)
//!
//! Timestamps ride the reserved extension type −1 in one of three layouts:
//! 32-bit seconds, 64-bit packed seconds + nanoseconds, or 96-bit
//! nanoseconds + signed seconds. The writer always picks the smallest layout
//! that holds the value losslessly.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::error::{Error, Result};

/// Extension type id reserved for timestamps.
pub const TIMESTAMP_EXTENSION_TYPE: i8 = -1;

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// Seconds bound of the 64-bit layout (34 unsigned bits).
const SECONDS_34_BIT_BOUND: i64 = 1 << 34;

/// An instant in time: seconds since the Unix epoch plus a nanosecond
/// adjustment in `0..1_000_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    seconds: i64,
    nanos: u32,
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self {
        seconds: 0,
        nanos: 0,
    };

    /// Create a timestamp from epoch seconds and a nanosecond adjustment.
    ///
    /// Fails with [`Error::InvalidValue`] when `nanos` is not below one
    /// billion.
    pub fn new(seconds: i64, nanos: u32) -> Result<Self> {
        if nanos >= NANOS_PER_SECOND {
            return Err(Error::InvalidValue(format!(
                "timestamp nanoseconds {nanos} not below {NANOS_PER_SECOND}"
            )));
        }
        Ok(Self { seconds, nanos })
    }

    /// Seconds since the Unix epoch. Negative for instants before it.
    #[must_use]
    pub const fn seconds(self) -> i64 {
        self.seconds
    }

    /// Nanosecond adjustment, always in `0..1_000_000_000`.
    #[must_use]
    pub const fn nanos(self) -> u32 {
        self.nanos
    }

    /// Wire payload length of the smallest lossless layout: 4, 8, or 12.
    #[must_use]
    pub const fn wire_length(self) -> u32 {
        if self.nanos == 0 && self.seconds >= 0 && self.seconds <= u32::MAX as i64 {
            4
        } else if self.seconds >= 0 && self.seconds < SECONDS_34_BIT_BOUND {
            8
        } else {
            12
        }
    }

    /// Pack into the 64-bit layout: upper 30 bits nanoseconds, lower 34 bits
    /// seconds. Caller must have checked [`Self::wire_length`] is 8.
    pub(crate) const fn pack64(self) -> u64 {
        ((self.nanos as u64) << 34) | (self.seconds as u64)
    }

    /// Unpack the 64-bit layout.
    pub(crate) fn unpack64(raw: u64) -> Result<Self> {
        let nanos = (raw >> 34) as u32;
        let seconds = (raw & ((1 << 34) - 1)) as i64;
        Self::new(seconds, nanos)
    }
}

impl TryFrom<SystemTime> for Timestamp {
    type Error = Error;

    fn try_from(time: SystemTime) -> Result<Self> {
        match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => {
                let seconds = i64::try_from(elapsed.as_secs())
                    .map_err(|_| Error::InvalidValue("system time beyond i64 seconds".into()))?;
                Self::new(seconds, elapsed.subsec_nanos())
            }
            Err(err) => {
                // Pre-epoch instants carry a positive duration back to the
                // epoch; fold the nanosecond part into the previous second.
                let before = err.duration();
                let mut seconds = -i64::try_from(before.as_secs())
                    .map_err(|_| Error::InvalidValue("system time beyond i64 seconds".into()))?;
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    seconds -= 1;
                    nanos = NANOS_PER_SECOND - nanos;
                }
                Self::new(seconds, nanos)
            }
        }
    }
}

impl TryFrom<Timestamp> for SystemTime {
    type Error = Error;

    fn try_from(timestamp: Timestamp) -> Result<Self> {
        let result = if timestamp.seconds >= 0 {
            UNIX_EPOCH.checked_add(Duration::new(
                timestamp.seconds as u64,
                timestamp.nanos,
            ))
        } else {
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(timestamp.seconds.unsigned_abs()))
                .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(timestamp.nanos))))
        };
        result.ok_or_else(|| {
            Error::InvalidValue("timestamp not representable as SystemTime".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_validated() {
        assert!(Timestamp::new(0, NANOS_PER_SECOND - 1).is_ok());
        assert!(matches!(
            Timestamp::new(0, NANOS_PER_SECOND),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn test_wire_length_selection() {
        assert_eq!(Timestamp::EPOCH.wire_length(), 4);
        assert_eq!(Timestamp::new(u32::MAX.into(), 0).unwrap().wire_length(), 4);
        assert_eq!(Timestamp::new(0, 1).unwrap().wire_length(), 8);
        assert_eq!(
            Timestamp::new(i64::from(u32::MAX) + 1, 0).unwrap().wire_length(),
            8
        );
        assert_eq!(
            Timestamp::new(SECONDS_34_BIT_BOUND - 1, 999_999_999)
                .unwrap()
                .wire_length(),
            8
        );
        assert_eq!(
            Timestamp::new(SECONDS_34_BIT_BOUND, 0).unwrap().wire_length(),
            12
        );
        assert_eq!(Timestamp::new(-1, 0).unwrap().wire_length(), 12);
    }

    #[test]
    fn test_pack64_roundtrip() {
        let ts = Timestamp::new(SECONDS_34_BIT_BOUND - 1, 999_999_999).unwrap();
        assert_eq!(Timestamp::unpack64(ts.pack64()).unwrap(), ts);

        let ts = Timestamp::new(1, 1).unwrap();
        assert_eq!(Timestamp::unpack64(ts.pack64()).unwrap(), ts);
    }

    #[test]
    fn test_system_time_conversions() {
        let ts = Timestamp::new(1_700_000_000, 123_456_789).unwrap();
        let time = SystemTime::try_from(ts).unwrap();
        assert_eq!(Timestamp::try_from(time).unwrap(), ts);

        let before_epoch = Timestamp::new(-2, 999_999_999).unwrap();
        let time = SystemTime::try_from(before_epoch).unwrap();
        assert_eq!(Timestamp::try_from(time).unwrap(), before_epoch);
    }
}
