//! Profiling timeout parsing.
//!
//! Accepts either an integer number of seconds or a string with a unit
//! suffix (`ms`, `s`, `m`, `h`). Always serializes back as whole seconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Default per-resource timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Deadline for the polling phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProfilingTimeout(Duration);

impl ProfilingTimeout {
    /// Wrap a duration.
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Timeout of the given number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// The wrapped duration.
    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ProfilingTimeout {
    fn default() -> Self {
        Self(DEFAULT_TIMEOUT)
    }
}

impl fmt::Display for ProfilingTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.subsec_millis() == 0 {
            write!(f, "{}s", self.0.as_secs())
        } else {
            write!(f, "{}ms", self.0.as_millis())
        }
    }
}

impl FromStr for ProfilingTimeout {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);

        if digits.is_empty() {
            return Err(Error::invalid_duration(input, "missing numeric value"));
        }

        let value: u64 = digits
            .parse()
            .map_err(|e| Error::invalid_duration(input, format!("{e}")))?;

        let duration = match unit.trim() {
            "" | "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            other => {
                return Err(Error::invalid_duration(
                    input,
                    format!("unknown unit '{other}'"),
                ));
            }
        };

        Ok(Self(duration))
    }
}

impl Serialize for ProfilingTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct TimeoutVisitor;

impl Visitor<'_> for TimeoutVisitor {
    type Value = ProfilingTimeout;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("seconds as an integer or a duration string like \"30s\" or \"5m\"")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
        Ok(ProfilingTimeout::from_secs(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
        u64::try_from(value)
            .map(ProfilingTimeout::from_secs)
            .map_err(|_| E::custom("timeout must not be negative"))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
        value.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for ProfilingTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(TimeoutVisitor)
    }
}
