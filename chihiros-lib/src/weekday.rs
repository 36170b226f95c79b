use crate::constants::EVERYDAY_MASK;
use crate::error::{ChihirosError, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

/// Day of week with its bit in the 7-bit schedule mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, IntoPrimitive, TryFromPrimitive)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Weekday {
    #[strum(to_string = "Mon")]
    Monday = 64,
    #[strum(to_string = "Tue")]
    Tuesday = 32,
    #[strum(to_string = "Wed")]
    Wednesday = 16,
    #[strum(to_string = "Thu")]
    Thursday = 8,
    #[strum(to_string = "Fri")]
    Friday = 4,
    #[strum(to_string = "Sat")]
    Saturday = 2,
    #[strum(to_string = "Sun")]
    Sunday = 1,
}

impl Weekday {
    /// Monday first, the order used for display.
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn bit(self) -> u8 {
        self.into()
    }

    pub fn name(self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// One entry of a user's day selection: a weekday or the "everyday" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaySelect {
    Everyday,
    Day(Weekday),
}

impl FromStr for DaySelect {
    type Err = ChihirosError;

    fn from_str(s: &str) -> Result<Self> {
        let day = match s.trim().to_ascii_lowercase().as_str() {
            "everyday" | "every day" | "daily" | "all" => return Ok(DaySelect::Everyday),
            "mon" | "monday" => Weekday::Monday,
            "tue" | "tuesday" => Weekday::Tuesday,
            "wed" | "wednesday" => Weekday::Wednesday,
            "thu" | "thursday" => Weekday::Thursday,
            "fri" | "friday" => Weekday::Friday,
            "sat" | "saturday" => Weekday::Saturday,
            "sun" | "sunday" => Weekday::Sunday,
            other => {
                return Err(ChihirosError::InvalidParameter(format!("unknown weekday {other:?}")));
            }
        };
        Ok(DaySelect::Day(day))
    }
}

/// A set of weekdays backed by the 7-bit wire mask.
///
/// The full set is the wire literal 127 and reads as "everyday".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EVERYDAY: WeekdaySet = WeekdaySet(EVERYDAY_MASK);
    pub const EMPTY: WeekdaySet = WeekdaySet(0);

    /// Decode a wire mask; bit 7 is ignored.
    pub fn from_mask(mask: u8) -> Self {
        Self(mask & EVERYDAY_MASK)
    }

    /// Encode a user selection. An empty selection, or one containing the
    /// everyday marker, yields 127.
    pub fn encode(selection: &[DaySelect]) -> Self {
        if selection.is_empty() || selection.contains(&DaySelect::Everyday) {
            return Self::EVERYDAY;
        }
        selection
            .iter()
            .filter_map(|s| match s {
                DaySelect::Day(day) => Some(*day),
                DaySelect::Everyday => None,
            })
            .collect()
    }

    pub fn mask(self) -> u8 {
        self.0
    }

    pub fn is_everyday(self) -> bool {
        self.0 == EVERYDAY_MASK
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & day.bit() != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= day.bit();
    }

    /// Days in the set, Monday first.
    pub fn days(self) -> impl Iterator<Item = Weekday> {
        Weekday::ALL.into_iter().filter(move |d| self.contains(*d))
    }

    /// Names as reported by captures: `["everyday"]` for 127, otherwise the
    /// lowercase day names.
    pub fn names(self) -> Vec<&'static str> {
        if self.is_everyday() {
            return vec!["everyday"];
        }
        self.days().map(Weekday::name).collect()
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = WeekdaySet::EMPTY;
        for day in iter {
            set.insert(day);
        }
        set
    }
}

impl fmt::Display for WeekdaySet {
    /// `Every day`, `None`, or short names such as `Mon,Wed,Fri`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_everyday() {
            return f.write_str("Every day");
        }
        if self.is_empty() {
            return f.write_str("None");
        }
        let short: Vec<String> = self.days().map(|d| d.to_string()).collect();
        f.write_str(&short.join(","))
    }
}
