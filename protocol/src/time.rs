//! Wall-clock time supplied to the MCU.

use chrono::{DateTime, Datelike, TimeZone, Timelike};

/// A calendar time as reported to the MCU.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct LocalTime {
    /// Full year, e.g. 2024.
    pub year: u16,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
    /// Hour, 0-23.
    pub hour: u8,
    /// Minute, 0-59.
    pub minute: u8,
    /// Second, 0-59.
    pub second: u8,
    /// Day of week, 1 (Monday) to 7 (Sunday).
    pub weekday: u8,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl LocalTime {
    /// Converts a Unix timestamp into a UTC calendar time.
    ///
    /// Returns `None` if the timestamp is out of the representable range.
    #[must_use]
    pub fn from_unix_timestamp(timestamp: u64) -> Option<Self> {
        let secs = i64::try_from(timestamp).ok()?;

        DateTime::from_timestamp(secs, 0).map(|time| Self::from_datetime(&time))
    }

    /// Converts a calendar time in any timezone, keeping its wall-clock fields.
    ///
    /// Times before the Unix epoch get a timestamp of 0.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_datetime<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        Self {
            year: u16::try_from(time.year()).unwrap_or_default(),
            // Bounded by the calendar
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
            weekday: time.weekday().number_from_monday() as u8,
            timestamp: u64::try_from(time.timestamp()).unwrap_or_default(),
        }
    }

    /// Serializes the time as sent in response to a time query.
    ///
    /// The first byte flags the time as valid, followed by the
    /// year offset from 2000, month, day, hour, minute, second and weekday.
    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        [
            0x01,
            u8::try_from(self.year.saturating_sub(2000)).unwrap_or(u8::MAX),
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.weekday,
        ]
    }
}

/// Payload telling the MCU that no valid time is available.
pub const MISSING_TIME_PAYLOAD: [u8; 8] = [0x00; 8];

/// Source of the current wall-clock time.
pub trait TimeSource {
    /// Returns the current local time, or `None` if the clock is not synchronized.
    fn now(&self) -> Option<LocalTime>;
}

impl<F: Fn() -> Option<LocalTime>> TimeSource for F {
    fn now(&self) -> Option<LocalTime> {
        self()
    }
}
