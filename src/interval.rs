use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minutes since midnight. The only time-of-day type.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("invalid time format: {0:?} (expected HH:mm)")]
    InvalidFormat(String),
    #[error("invalid interval {start}-{end}: end must be after start")]
    InvertedInterval { start: String, end: String },
    #[error("unknown weekday: {0:?} (expected Monday to Friday)")]
    UnknownWeekday(String),
}

/// Parse a strict `HH:mm` string (two digits each, hours 0-23, minutes 0-59).
pub fn to_minutes(time: &str) -> Result<Minute, TimeError> {
    let invalid = || TimeError::InvalidFormat(time.to_string());
    let (h, m) = time.split_once(':').ok_or_else(invalid)?;
    if h.len() != 2 || m.len() != 2 || !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: Minute = h.parse().map_err(|_| invalid())?;
    let minutes: Minute = m.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}

/// Render minutes since midnight as `HH:mm`. `24:00` is allowed as an end bound.
pub fn format_minutes(minutes: Minute) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open `[start, end)` overlap test.
pub fn overlaps(start_a: Minute, end_a: Minute, start_b: Minute, end_b: Minute) -> bool {
    start_a < end_b && start_b < end_a
}

/// Half-open interval `[start, end)` within one day. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    start: Minute,
    end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Result<Self, TimeError> {
        if end <= start || end > MINUTES_PER_DAY {
            return Err(TimeError::InvertedInterval {
                start: format_minutes(start),
                end: format_minutes(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds from `HH:mm` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, TimeError> {
        Self::new(to_minutes(start)?, to_minutes(end)?)
    }

    pub fn start(&self) -> Minute {
        self.start
    }

    pub fn end(&self) -> Minute {
        self.end
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Same duration, moved later by `offset` minutes. `None` if it would leave the day.
    pub fn shifted(&self, offset: Minute) -> Option<Span> {
        let start = self.start.checked_add(offset)?;
        let end = self.end.checked_add(offset)?;
        Span::new(start, end).ok()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", format_minutes(self.start), format_minutes(self.end))
    }
}

/// Teaching days. Weekends never carry recurring timetable entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Weekday {
    pub const ALL: [Weekday; 5] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
        }
    }

    /// Next teaching day, wrapping Friday back to Monday.
    pub fn next(&self) -> Weekday {
        let idx = Self::ALL.iter().position(|d| d == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }

    pub fn from_date(date: NaiveDate) -> Option<Weekday> {
        match date.weekday() {
            chrono::Weekday::Mon => Some(Weekday::Monday),
            chrono::Weekday::Tue => Some(Weekday::Tuesday),
            chrono::Weekday::Wed => Some(Weekday::Wednesday),
            chrono::Weekday::Thu => Some(Weekday::Thursday),
            chrono::Weekday::Fri => Some(Weekday::Friday),
            chrono::Weekday::Sat | chrono::Weekday::Sun => None,
        }
    }
}

impl FromStr for Weekday {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| TimeError::UnknownWeekday(s.to_string()))
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_valid_times() {
        assert_eq!(to_minutes("00:00"), Ok(0));
        assert_eq!(to_minutes("09:30"), Ok(570));
        assert_eq!(to_minutes("23:59"), Ok(1439));
    }

    #[test]
    fn rejects_malformed_times() {
        let malformed = [
            "24:00", "12:60", "9:00", "09:0", "0900", "ab:cd", "", "09:00:00", "-1:00", "+9:00",
        ];
        for bad in malformed {
            assert!(
                matches!(to_minutes(bad), Err(TimeError::InvalidFormat(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn format_roundtrips_through_parse() {
        assert_eq!(format_minutes(570), "09:30");
        assert_eq!(format_minutes(MINUTES_PER_DAY), "24:00");
        assert_eq!(to_minutes(&format_minutes(1005)), Ok(1005));
    }

    #[test]
    fn span_rejects_empty_and_inverted() {
        assert!(Span::new(600, 600).is_err());
        assert!(Span::new(660, 600).is_err());
        assert!(Span::parse("11:00", "10:00").is_err());
        assert!(Span::new(0, MINUTES_PER_DAY).is_ok());
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let a = Span::parse("10:00", "11:00").unwrap();
        let b = Span::parse("11:00", "12:00").unwrap();
        let c = Span::parse("10:30", "11:30").unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn shifted_drops_spans_past_midnight() {
        let late = Span::parse("23:00", "23:45").unwrap();
        assert_eq!(late.shifted(30), None);
        let early = Span::parse("09:00", "10:00").unwrap();
        assert_eq!(early.shifted(30), Some(Span::parse("09:30", "10:30").unwrap()));
    }

    #[test]
    fn weekday_parsing_and_cycle() {
        assert_eq!("monday".parse::<Weekday>(), Ok(Weekday::Monday));
        assert_eq!(" Friday ".parse::<Weekday>(), Ok(Weekday::Friday));
        assert!("Saturday".parse::<Weekday>().is_err());
        assert_eq!(Weekday::Friday.next(), Weekday::Monday);
        assert_eq!(Weekday::Tuesday.next(), Weekday::Wednesday);
    }

    #[test]
    fn weekday_from_date() {
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(Weekday::from_date(monday), Some(Weekday::Monday));
        let saturday = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(Weekday::from_date(saturday), None);
    }

    fn span_strategy() -> impl Strategy<Value = (Minute, Minute)> {
        (0..MINUTES_PER_DAY).prop_flat_map(|start| (Just(start), (start + 1)..=MINUTES_PER_DAY))
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric((a, b) in span_strategy(), (c, d) in span_strategy()) {
            prop_assert_eq!(overlaps(a, b, c, d), overlaps(c, d, a, b));
        }

        #[test]
        fn shared_boundary_never_overlaps((a, b) in span_strategy(), len in 1..=60u16) {
            prop_assume!(b + len <= MINUTES_PER_DAY);
            prop_assert!(!overlaps(a, b, b, b + len));
        }

        #[test]
        fn span_overlaps_itself((a, b) in span_strategy()) {
            let s = Span::new(a, b).unwrap();
            prop_assert!(s.overlaps(&s));
        }
    }
}
