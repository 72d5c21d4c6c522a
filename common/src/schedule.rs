use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const SLOT_COUNT: usize = 6;
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Upper bound accepted by `set_timer` for on/off minutes.
pub const MAX_SCHEDULE_MINUTE: u16 = 1410;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [Self; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    /// Monday = 1 .. Sunday = 7, the value reported as `current_day`.
    pub fn number(self) -> u8 {
        match self {
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
            Self::Sun => 7,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Mon),
            2 => Some(Self::Tue),
            3 => Some(Self::Wed),
            4 => Some(Self::Thu),
            5 => Some(Self::Fri),
            6 => Some(Self::Sat),
            7 => Some(Self::Sun),
            _ => None,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

/// Seven-bit weekday set. Bit 0 is Monday, bit 6 is Sunday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct DayMask(u8);

impl DayMask {
    pub const NONE: Self = Self(0);
    pub const EVERY_DAY: Self = Self(0x7F);
    pub const WEEKDAYS: Self = Self(0x1F);
    pub const WEEKEND: Self = Self(0x60);

    pub fn new(bits: u8) -> Result<Self, ValidationError> {
        if bits > Self::EVERY_DAY.0 {
            return Err(ValidationError::Days);
        }
        Ok(Self(bits))
    }

    pub fn from_bits_truncate(bits: u16) -> Self {
        Self((bits & 0x7F) as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, day: DayOfWeek) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn with(self, day: DayOfWeek) -> Self {
        Self(self.0 | Self::bit(day))
    }

    pub fn without(self, day: DayOfWeek) -> Self {
        Self(self.0 & !Self::bit(day))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn bit(day: DayOfWeek) -> u8 {
        1 << (day.number() - 1)
    }
}

impl TryFrom<u8> for DayMask {
    type Error = ValidationError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::new(bits)
    }
}

impl From<DayMask> for u8 {
    fn from(mask: DayMask) -> Self {
        mask.0
    }
}

impl FromIterator<DayOfWeek> for DayMask {
    fn from_iter<I: IntoIterator<Item = DayOfWeek>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

/// One weekly on/off rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleSlot {
    pub days: DayMask,
    pub on_minute: u16,
    pub off_minute: u16,
}

impl ScheduleSlot {
    pub const DISABLED: Self = Self {
        days: DayMask::NONE,
        on_minute: 420,
        off_minute: 420,
    };

    pub fn new(days: u8, on_minute: u16, off_minute: u16) -> Result<Self, ValidationError> {
        let days = DayMask::new(days)?;
        if on_minute > MAX_SCHEDULE_MINUTE {
            return Err(ValidationError::OnTime);
        }
        if off_minute > MAX_SCHEDULE_MINUTE {
            return Err(ValidationError::OffTime);
        }
        Ok(Self {
            days,
            on_minute,
            off_minute,
        })
    }

    /// `on == off` is disabled; `on > off` wraps past midnight.
    pub fn is_active(&self, day: DayOfWeek, minute: u16) -> bool {
        if self.on_minute == self.off_minute || !self.days.contains(day) {
            return false;
        }

        if self.on_minute < self.off_minute {
            (self.on_minute..self.off_minute).contains(&minute)
        } else {
            minute >= self.on_minute || minute < self.off_minute
        }
    }

    /// Wire form `[day_mask, on_minute, off_minute]`.
    pub fn as_triple(&self) -> [u16; 3] {
        [self.days.bits() as u16, self.on_minute, self.off_minute]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleTable {
    slots: [ScheduleSlot; SLOT_COUNT],
}

impl Default for ScheduleTable {
    fn default() -> Self {
        let mut slots = [ScheduleSlot::DISABLED; SLOT_COUNT];
        slots[0] = ScheduleSlot {
            days: DayMask::EVERY_DAY,
            on_minute: 390,
            off_minute: 450,
        };
        Self { slots }
    }
}

impl ScheduleTable {
    pub fn from_slots(slots: [ScheduleSlot; SLOT_COUNT]) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[ScheduleSlot; SLOT_COUNT] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&ScheduleSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ScheduleSlot> {
        self.slots.get_mut(index)
    }

    /// Replace the slot addressed by the 1-based API `timer_number`.
    pub fn set_timer(&mut self, timer_number: u8, slot: ScheduleSlot) -> Result<(), ValidationError> {
        let index = timer_index(timer_number)?;
        self.slots[index] = slot;
        Ok(())
    }

    pub fn triples(&self) -> [[u16; 3]; SLOT_COUNT] {
        self.slots.map(|slot| slot.as_triple())
    }

    pub fn any_active(&self, day: DayOfWeek, minute: u16) -> bool {
        self.slots.iter().any(|slot| slot.is_active(day, minute))
    }
}

/// Maps a 1-based `timer_number` onto a slot index.
pub fn timer_index(timer_number: u8) -> Result<usize, ValidationError> {
    match timer_number {
        1..=6 => Ok(usize::from(timer_number) - 1),
        _ => Err(ValidationError::TimerNumber),
    }
}

/// Holiday mode wins over everything, boost included.
pub fn evaluate(
    table: &ScheduleTable,
    heating_enabled: bool,
    boost_active: bool,
    day: DayOfWeek,
    minute: u16,
) -> bool {
    heating_enabled && (boost_active || table.any_active(day, minute))
}
