use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::schedule::DayOfWeek;

/// Calendar reading from the hardware clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTimeParts {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl DateTimeParts {
    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self {
            year: value.year().clamp(0, i32::from(u16::MAX)) as u16,
            month: value.month() as u8,
            day: value.day() as u8,
            hour: value.hour() as u8,
            minute: value.minute() as u8,
        }
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
    }

    pub fn current_time(&self) -> CurrentTime {
        CurrentTime {
            day: day_of_week(self.year, self.month, self.day),
            minute: u16::from(self.hour.min(23)) * 60 + u16::from(self.minute.min(59)),
        }
    }
}

/// Day and minute-of-day fed to the evaluator each schedule tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentTime {
    pub day: DayOfWeek,
    pub minute: u16,
}

impl CurrentTime {
    pub fn new(day: DayOfWeek, minute: u16) -> Self {
        Self { day, minute }
    }
}

/// Source of wall-clock readings. SNTP or a user may set it.
pub trait HardwareClock {
    fn now(&self) -> DateTimeParts;

    fn set(&mut self, value: DateTimeParts);
}

/// Zeller's congruence, Sunday = 7.
pub fn day_of_week(year: u16, month: u8, day: u8) -> DayOfWeek {
    let (mut year, mut month) = (i32::from(year), i32::from(month));
    if month < 3 {
        month += 12;
        year -= 1;
    }

    let k = year.rem_euclid(100);
    let j = year.div_euclid(100);
    // 0 = Saturday, 1 = Sunday, 2 = Monday, ...
    let h = (i32::from(day) + 13 * (month + 1) / 5 + k + k / 4 + j / 4 + 5 * j).rem_euclid(7);

    match h {
        0 => DayOfWeek::Sat,
        1 => DayOfWeek::Sun,
        2 => DayOfWeek::Mon,
        3 => DayOfWeek::Tue,
        4 => DayOfWeek::Wed,
        5 => DayOfWeek::Thu,
        _ => DayOfWeek::Fri,
    }
}
