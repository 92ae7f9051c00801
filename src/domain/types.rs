//! Shared domain enumerations.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// A user's ballot on a post. `Neutral` doubles as "no prior vote".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum VoteValue {
    Down,
    #[default]
    Neutral,
    Up,
}

impl VoteValue {
    pub fn as_i8(self) -> i8 {
        match self {
            VoteValue::Down => -1,
            VoteValue::Neutral => 0,
            VoteValue::Up => 1,
        }
    }

    pub fn as_i16(self) -> i16 {
        i16::from(self.as_i8())
    }
}

impl From<VoteValue> for i8 {
    fn from(value: VoteValue) -> Self {
        value.as_i8()
    }
}

impl TryFrom<i8> for VoteValue {
    type Error = DomainError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(VoteValue::Down),
            0 => Ok(VoteValue::Neutral),
            1 => Ok(VoteValue::Up),
            other => Err(DomainError::validation(format!(
                "vote value must be -1, 0 or 1, got {other}"
            ))),
        }
    }
}

impl TryFrom<i64> for VoteValue {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        i8::try_from(value)
            .map_err(|_| DomainError::validation(format!("vote value {value} out of range")))
            .and_then(VoteValue::try_from)
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i8())
    }
}

/// Ordering applied when listing posts inside a community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    Time,
    #[default]
    Score,
}

impl RankOrder {
    /// Resolve a user-supplied order; anything other than `time` ranks by score.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("time") => RankOrder::Time,
            _ => RankOrder::Score,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RankOrder::Time => "time",
            RankOrder::Score => "score",
        }
    }
}
