use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::ImapError;

pub const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// An IMAP date-time (`"dd-Mon-yyyy hh:mm:ss +zzzz"`).  Field ranges are
/// validated when the value is emitted, not when it is built, so a
/// parser can carry a peer's bad value up to the layer that reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImapTime {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
    /// Signed hours part of the zone, -99..=99 on the wire.
    pub z_hour: i32,
    pub z_min: u32,
}

impl ImapTime {
    pub fn is_zero(&self) -> bool {
        *self == ImapTime::default()
    }

    pub fn validate(&self) -> Result<(), ImapError> {
        let ok = (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.year >= 1000
            && self.year <= 9999
            && self.hour < 24
            && self.min < 60
            && self.sec < 61
            && self.z_hour.abs() < 100
            && self.z_min < 60;
        if ok {
            Ok(())
        } else {
            Err(ImapError::Value(format!("invalid date-time: {self:?}")))
        }
    }

    pub fn month_name(&self) -> &'static str {
        MONTHS[(self.month as usize - 1).min(11)]
    }

    /// Seconds since the unix epoch.  Out-of-range values clamp to the
    /// epoch; `validate` is where bad fields get reported.
    pub fn to_epoch(&self) -> i64 {
        let date = match NaiveDate::from_ymd_opt(self.year as i32, self.month, self.day) {
            Some(d) => d,
            None => return 0,
        };
        let time = match NaiveTime::from_hms_opt(self.hour, self.min, self.sec.min(59)) {
            Some(t) => t,
            None => return 0,
        };
        let local = NaiveDateTime::new(date, time).and_utc().timestamp();
        let zone = self.z_hour as i64 * 3600
            + if self.z_hour < 0 {
                -(self.z_min as i64 * 60)
            } else {
                self.z_min as i64 * 60
            };
        local - zone
    }

    /// Build from a unix timestamp, UTC zone.
    pub fn from_epoch(secs: i64) -> ImapTime {
        let dt = DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH);
        ImapTime {
            year: dt.year().max(0) as u32,
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            min: dt.minute(),
            sec: dt.second(),
            z_hour: 0,
            z_min: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let mut t = ImapTime::from_epoch(0);
        assert!(t.validate().is_ok());
        t.month = 13;
        assert!(t.validate().is_err());
        t.month = 12;
        t.hour = 24;
        assert!(t.validate().is_err());
    }

    #[test]
    fn epoch_roundtrip() {
        for &secs in &[0i64, 86399, 951868800, 1700000000] {
            let t = ImapTime::from_epoch(secs);
            assert_eq!(t.to_epoch(), secs, "secs={secs} t={t:?}");
            assert!(t.validate().is_ok());
        }
        let t = ImapTime::from_epoch(951868800);
        assert_eq!((t.year, t.month, t.day), (2000, 2, 29));
    }

    #[test]
    fn negative_zone() {
        let mut t = ImapTime::from_epoch(3600);
        t.z_hour = -1;
        t.z_min = 0;
        assert_eq!(t.to_epoch(), 7200);
    }
}
