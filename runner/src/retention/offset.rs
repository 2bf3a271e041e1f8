use super::RetentionError;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use std::{fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DateUnit {
    YearStart,
    MonthStart,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl DateUnit {
    pub const ALL: [DateUnit; 7] = [
        Self::YearStart,
        Self::MonthStart,
        Self::Week,
        Self::Day,
        Self::Hour,
        Self::Minute,
        Self::Second,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Self::YearStart => "YS",
            Self::MonthStart => "MS",
            Self::Week => "W",
            Self::Day => "D",
            Self::Hour => "H",
            Self::Minute => "T",
            Self::Second => "S",
        }
    }
}

/// `<count><unit>` step between permanent restarts, e.g. `1YS` or `30D`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DateOffset {
    pub count: u32,
    pub unit: DateUnit,
}

impl DateOffset {
    /// Advance `date` by this offset. Year and month start units land on the first
    /// instant of the resulting year or month. `None` if the result is out of range.
    pub fn add_to(&self, date: NaiveDateTime) -> Option<NaiveDateTime> {
        let count = i64::from(self.count);

        match self.unit {
            DateUnit::YearStart => {
                let year = date.year().checked_add(i32::try_from(self.count).ok()?)?;
                NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)
            }
            DateUnit::MonthStart => {
                let months = i64::from(date.year()) * 12 + i64::from(date.month0()) + count;
                let year = i32::try_from(months.div_euclid(12)).ok()?;
                let month = u32::try_from(months.rem_euclid(12)).ok()? + 1;
                NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
            }
            DateUnit::Week => date.checked_add_signed(Duration::weeks(count)),
            DateUnit::Day => date.checked_add_signed(Duration::days(count)),
            DateUnit::Hour => date.checked_add_signed(Duration::hours(count)),
            DateUnit::Minute => date.checked_add_signed(Duration::minutes(count)),
            DateUnit::Second => date.checked_add_signed(Duration::seconds(count)),
        }
    }
}

impl FromStr for DateOffset {
    type Err = RetentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, code) = value.split_at(split);

        let unit = DateUnit::ALL
            .into_iter()
            .find(|unit| unit.code() == code)
            .ok_or_else(|| RetentionError::UnsupportedUnit(code.to_owned()))?;

        if digits.is_empty() {
            return Err(RetentionError::MissingMagnitude(value.to_owned()));
        }

        let count = digits
            .parse()
            .map_err(|_| RetentionError::InvalidFrequency(value.to_owned()))?;

        if count == 0 {
            return Err(RetentionError::InvalidFrequency(value.to_owned()));
        }

        Ok(Self { count, unit })
    }
}

impl fmt::Display for DateOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.code())
    }
}
