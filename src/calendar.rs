//! CF time coordinates: `<unit> since <reference>` decoded under the file's
//! calendar, precise enough to tell which month a record belongs to.

use chrono::{Datelike, NaiveDate, TimeDelta, Timelike};

const SECONDS_PER_DAY: i64 = 86_400;
const NOLEAP_MONTHS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
const ALL_LEAP_MONTHS: [i64; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
const DAY360_MONTHS: [i64; 12] = [30; 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    Standard,
    NoLeap,
    AllLeap,
    Day360,
}

impl Calendar {
    /// A missing calendar attribute means `standard`. Calendars that cannot
    /// be decoded here, such as `julian`, give `None`.
    pub fn parse(name: Option<&str>) -> Option<Self> {
        let name = name.map(|name| name.trim().to_lowercase()).unwrap_or_default();
        match name.as_str() {
            "" | "standard" | "gregorian" | "proleptic_gregorian" => Some(Calendar::Standard),
            "noleap" | "no_leap" | "365_day" => Some(Calendar::NoLeap),
            "all_leap" | "366_day" => Some(Calendar::AllLeap),
            "360_day" => Some(Calendar::Day360),
            _ => None,
        }
    }

    fn fixed_months(&self) -> Option<&'static [i64; 12]> {
        match self {
            Calendar::Standard => None,
            Calendar::NoLeap => Some(&NOLEAP_MONTHS),
            Calendar::AllLeap => Some(&ALL_LEAP_MONTHS),
            Calendar::Day360 => Some(&DAY360_MONTHS),
        }
    }
}

/// Ordered by year, month, day and second of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CalendarDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub second_of_day: u32,
}

impl CalendarDate {
    pub fn month_start(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            day: 1,
            second_of_day: 0,
        }
    }

    pub fn next_month_start(&self) -> Self {
        if self.month == 12 {
            Self::month_start(self.year + 1, 1)
        } else {
            Self::month_start(self.year, self.month + 1)
        }
    }
}

impl std::fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (h, rest) = (self.second_of_day / 3600, self.second_of_day % 3600);
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year,
            self.month,
            self.day,
            h,
            rest / 60,
            rest % 60
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    pub seconds_per_unit: f64,
    pub reference: CalendarDate,
}

impl TimeUnits {
    /// Parses `days since 1991-01-01 00:00:00` and its usual variants.
    pub fn parse(units: &str) -> Option<Self> {
        let lower = units.trim().to_lowercase();
        let (unit, reference) = lower.split_once(" since ")?;
        let seconds_per_unit = match unit.trim() {
            "seconds" | "second" | "secs" | "s" => 1.0,
            "minutes" | "minute" | "mins" | "min" => 60.0,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3600.0,
            "days" | "day" | "d" => 86_400.0,
            _ => return None,
        };

        let reference = reference.trim().replace('T', " ");
        let mut parts = reference.split_whitespace();
        let mut ymd = parts.next()?.splitn(3, '-');
        let year: i32 = ymd.next()?.parse().ok()?;
        let month: u32 = ymd.next()?.parse().ok()?;
        let day: u32 = ymd.next()?.parse().ok()?;
        if !(1..=12).contains(&month) || day == 0 {
            return None;
        }
        let second_of_day = match parts.next() {
            Some(time) => {
                let mut hms = time.trim_end_matches('Z').split(':');
                let hours: u32 = hms.next()?.parse().ok()?;
                let minutes: u32 = hms.next().unwrap_or("0").parse().ok()?;
                let seconds: f64 = hms.next().unwrap_or("0").parse().ok()?;
                hours * 3600 + minutes * 60 + seconds as u32
            }
            None => 0,
        };
        Some(Self {
            seconds_per_unit,
            reference: CalendarDate {
                year,
                month,
                day,
                second_of_day,
            },
        })
    }

    /// Date of one time value, rounded to the second.
    pub fn decode(&self, value: f64, calendar: Calendar) -> Option<CalendarDate> {
        let offset = value * self.seconds_per_unit;
        if !offset.is_finite() {
            return None;
        }
        let offset = offset.round() as i64 + i64::from(self.reference.second_of_day);
        match calendar.fixed_months() {
            None => decode_standard(self.reference, offset),
            Some(months) => decode_fixed(self.reference, offset, months),
        }
    }
}

fn decode_standard(reference: CalendarDate, offset: i64) -> Option<CalendarDate> {
    let start = NaiveDate::from_ymd_opt(reference.year, reference.month, reference.day)?
        .and_hms_opt(0, 0, 0)?;
    let at = start.checked_add_signed(TimeDelta::try_seconds(offset)?)?;
    Some(CalendarDate {
        year: at.year(),
        month: at.month(),
        day: at.day(),
        second_of_day: at.num_seconds_from_midnight(),
    })
}

fn decode_fixed(reference: CalendarDate, offset: i64, months: &[i64; 12]) -> Option<CalendarDate> {
    let year_len: i64 = months.iter().sum();
    let month_index = usize::try_from(reference.month.checked_sub(1)?).ok()?;
    if i64::from(reference.day) > *months.get(month_index)? {
        return None;
    }
    let reference_day = i64::from(reference.year) * year_len
        + months[..month_index].iter().sum::<i64>()
        + i64::from(reference.day)
        - 1;
    let total = reference_day.checked_mul(SECONDS_PER_DAY)?.checked_add(offset)?;
    let days = total.div_euclid(SECONDS_PER_DAY);
    let second_of_day = u32::try_from(total.rem_euclid(SECONDS_PER_DAY)).ok()?;

    let year = i32::try_from(days.div_euclid(year_len)).ok()?;
    let mut day_of_year = days.rem_euclid(year_len);
    let mut month = 1u32;
    for length in months {
        if day_of_year < *length {
            break;
        }
        day_of_year -= length;
        month += 1;
    }
    Some(CalendarDate {
        year,
        month,
        day: u32::try_from(day_of_year + 1).ok()?,
        second_of_day,
    })
}
