//! Human-readable duration values.
//!
//! Workflows describe waits the way people write them: `"5 second"`,
//! `"15 minutes"`, `"250ms"`. `DurationSpec` keeps the magnitude and unit
//! that were written, validates them once at parse time, and converts to
//! [`std::time::Duration`] on demand.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Unit of a [`DurationSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl DurationUnit {
    /// Length of one unit in milliseconds.
    pub const fn millis(self) -> u64 {
        match self {
            DurationUnit::Millisecond => 1,
            DurationUnit::Second => 1_000,
            DurationUnit::Minute => 60_000,
            DurationUnit::Hour => 3_600_000,
            DurationUnit::Day => 86_400_000,
            DurationUnit::Week => 604_800_000,
        }
    }

    fn label(self) -> &'static str {
        match self {
            DurationUnit::Millisecond => "millisecond",
            DurationUnit::Second => "second",
            DurationUnit::Minute => "minute",
            DurationUnit::Hour => "hour",
            DurationUnit::Day => "day",
            DurationUnit::Week => "week",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        let unit = match word {
            "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => DurationUnit::Millisecond,
            "s" | "sec" | "secs" | "second" | "seconds" => DurationUnit::Second,
            "m" | "min" | "mins" | "minute" | "minutes" => DurationUnit::Minute,
            "h" | "hr" | "hrs" | "hour" | "hours" => DurationUnit::Hour,
            "d" | "day" | "days" => DurationUnit::Day,
            "w" | "week" | "weeks" => DurationUnit::Week,
            _ => return None,
        };
        Some(unit)
    }
}

/// A validated duration: magnitude plus unit.
///
/// Serializes as its display string (`"5 seconds"`), so config files and
/// persisted fingerprints stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DurationSpec {
    magnitude: u64,
    unit: DurationUnit,
}

impl DurationSpec {
    pub const ZERO: DurationSpec = DurationSpec::new(0, DurationUnit::Millisecond);

    /// Construct from parts. Callers building specs from user input should
    /// go through [`FromStr`] instead, which rejects overflowing values.
    pub const fn new(magnitude: u64, unit: DurationUnit) -> Self {
        Self { magnitude, unit }
    }

    pub const fn millis(n: u64) -> Self {
        Self::new(n, DurationUnit::Millisecond)
    }

    pub const fn seconds(n: u64) -> Self {
        Self::new(n, DurationUnit::Second)
    }

    pub const fn minutes(n: u64) -> Self {
        Self::new(n, DurationUnit::Minute)
    }

    pub const fn hours(n: u64) -> Self {
        Self::new(n, DurationUnit::Hour)
    }

    pub fn magnitude(&self) -> u64 {
        self.magnitude
    }

    pub fn unit(&self) -> DurationUnit {
        self.unit
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude == 0
    }

    /// Total length in milliseconds, saturating on overflow.
    pub fn as_millis(&self) -> u64 {
        self.magnitude.saturating_mul(self.unit.millis())
    }

    pub fn to_std(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }
}

impl Default for DurationSpec {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.magnitude == 1 { "" } else { "s" };
        write!(f, "{} {}{}", self.magnitude, self.unit.label(), plural)
    }
}

impl FromStr for DurationSpec {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidDuration {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, rest) = trimmed.split_at(split);

        if digits.is_empty() {
            return Err(invalid("missing magnitude"));
        }
        let magnitude: u64 = digits
            .parse()
            .map_err(|_| invalid("magnitude out of range"))?;

        let word = rest.trim().to_ascii_lowercase();
        if word.is_empty() {
            return Err(invalid("missing unit"));
        }
        let unit = DurationUnit::parse(&word).ok_or_else(|| invalid("unknown unit"))?;

        if magnitude.checked_mul(unit.millis()).is_none() {
            return Err(invalid("duration overflows"));
        }

        Ok(Self { magnitude, unit })
    }
}

impl TryFrom<String> for DurationSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DurationSpec> for String {
    fn from(value: DurationSpec) -> Self {
        value.to_string()
    }
}
