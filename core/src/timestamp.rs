//! Build timestamp.
//!
//! Every time value written into an archive, image config or SBOM comes from
//! a single `BuildTimestamp`. The host clock is never consulted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{BuildError, Result};

/// The fixed instant a build is stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildTimestamp(DateTime<Utc>);

impl BuildTimestamp {
    /// The Unix epoch, used when no build date is given.
    pub fn epoch() -> Self {
        BuildTimestamp(DateTime::<Utc>::default())
    }

    /// Parse RFC 3339 (`2023-01-01T00:00:00Z`) or integer Unix seconds.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(BuildError::ConfigurationError(
                "empty build date".to_string(),
            ));
        }

        if value.bytes().all(|b| b.is_ascii_digit()) {
            let secs: i64 = value.parse().map_err(|e| {
                BuildError::ConfigurationError(format!("invalid build date '{}': {}", value, e))
            })?;
            return Self::from_unix(secs);
        }

        let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
            BuildError::ConfigurationError(format!("invalid build date '{}': {}", value, e))
        })?;
        Self::from_unix(parsed.timestamp()).map_err(|_| {
            BuildError::ConfigurationError(format!(
                "build date '{}' is before the Unix epoch",
                value
            ))
        })
    }

    /// Timestamp from Unix seconds. Dates before the epoch are rejected.
    pub fn from_unix(secs: i64) -> Result<Self> {
        if secs < 0 {
            return Err(BuildError::ConfigurationError(format!(
                "build date {} is before the Unix epoch",
                secs
            )));
        }
        match Utc.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(t) => Ok(BuildTimestamp(t)),
            _ => Err(BuildError::ConfigurationError(format!(
                "build date out of range: {}",
                secs
            ))),
        }
    }

    /// Seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> u64 {
        // never negative, see `from_unix`
        self.0.timestamp().unsigned_abs()
    }

    /// RFC 3339 with second precision and a `Z` suffix.
    pub fn rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Default for BuildTimestamp {
    fn default() -> Self {
        Self::epoch()
    }
}

impl FromStr for BuildTimestamp {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BuildTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rfc3339())
    }
}
