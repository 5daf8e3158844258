use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// ISO 3166-1 alpha-2 country code, always two uppercase ASCII letters
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid country code '{0}': expected two ASCII letters")]
pub struct InvalidCountryCode(pub String);

impl CountryCode {
    /// Normalize a raw code to uppercase, rejecting anything that is not
    /// exactly two ASCII letters
    pub fn parse(raw: &str) -> Result<Self, InvalidCountryCode> {
        let trimmed = raw.trim();
        if trimmed.len() == 2 && trimmed.bytes().all(|b| b.is_ascii_alphabetic()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(InvalidCountryCode(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CountryCode {
    type Err = InvalidCountryCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CountryCode {
    type Error = InvalidCountryCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}

impl AsRef<str> for CountryCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Aggregate visit statistics for one country
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CountryStat {
    pub country_code: String,
    pub total_visits: i64,
    pub blocked_visits: i64,
    /// Unix timestamp (seconds) of the first recorded visit
    pub first_visit: Option<i64>,
    /// Unix timestamp (seconds) of the most recent recorded visit
    pub last_visit: Option<i64>,
}
