//! Human-readable sizes and durations for configuration values
//!
//! Both types accept either a bare integer (bytes / milliseconds) or a string
//! with a unit suffix, so TOML and environment overrides can say `"16MB"` or
//! `"1500ms"` instead of raw numbers.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),
}

/// Split `"15MB"` into `(15, "MB")`. A bare number yields an empty unit.
fn split_number_unit(raw: &str) -> Result<(u64, String), ParseError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ParseError::InvalidFormat(raw.to_string()));
    }

    let pos = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if pos == 0 {
        return Err(ParseError::InvalidFormat(raw.to_string()));
    }

    let num = s[..pos].parse::<u64>()?;
    Ok((num, s[pos..].trim().to_ascii_lowercase()))
}

/// Byte size wrapper with human-readable parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, unit) = split_number_unit(s)?;
        let multiplier: u64 = match unit.as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            _ => return Err(ParseError::InvalidUnit(unit)),
        };
        Ok(ByteSize(num * multiplier))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[(&str, u64)] = &[("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
        for &(unit, divisor) in UNITS {
            if self.0 >= divisor && self.0 % divisor == 0 {
                return write!(f, "{}{}", self.0 / divisor, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

/// Duration wrapper accepting `"250ms"`, `"3s"`, `"2m"`, `"1h"` or bare milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

impl FromStr for HumanDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, unit) = split_number_unit(s)?;
        let duration = match unit.as_str() {
            "" | "ms" => Duration::from_millis(num),
            "s" | "sec" | "secs" => Duration::from_secs(num),
            "m" | "min" | "mins" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            _ => return Err(ParseError::InvalidUnit(unit)),
        };
        Ok(HumanDuration(duration))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms == 0 {
            return write!(f, "0ms");
        }
        if ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else if ms % 1000 == 0 {
            write!(f, "{}s", ms / 1000)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

/// Visitor shared by both wrappers: integers pass through, strings are parsed.
struct HumanVisitor<T>(std::marker::PhantomData<T>, &'static str);

impl<'de, T> serde::de::Visitor<'de> for HumanVisitor<T>
where
    T: FromStr<Err = ParseError> + FromU64,
{
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.1)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(T::from_u64(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .map(T::from_u64)
            .map_err(|_| E::custom(format!("negative value: {v}")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse::<T>().map_err(serde::de::Error::custom)
    }
}

trait FromU64 {
    fn from_u64(v: u64) -> Self;
}

impl FromU64 for ByteSize {
    fn from_u64(v: u64) -> Self {
        ByteSize(v)
    }
}

impl FromU64 for HumanDuration {
    fn from_u64(v: u64) -> Self {
        HumanDuration::from_millis(v)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(HumanVisitor(
            std::marker::PhantomData,
            "a byte size as string (e.g. \"16MB\") or integer",
        ))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(HumanVisitor(
            std::marker::PhantomData,
            "a duration as string (e.g. \"3s\", \"500ms\") or integer milliseconds",
        ))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sizes() {
        assert_eq!("1024".parse::<ByteSize>().unwrap().as_u64(), 1024);
        assert_eq!("1KB".parse::<ByteSize>().unwrap().as_u64(), 1024);
        assert_eq!("16MB".parse::<ByteSize>().unwrap().as_u64(), 16 * 1024 * 1024);
        assert_eq!("2g".parse::<ByteSize>().unwrap().as_u64(), 2 * 1024 * 1024 * 1024);
        assert!("MB".parse::<ByteSize>().is_err());
        assert!("5XB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(
            "1500".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            "250ms".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_millis(250)
        );
        assert_eq!(
            "3s".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(3)
        );
        assert_eq!(
            "2m".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(120)
        );
        assert!("".parse::<HumanDuration>().is_err());
        assert!("3 fortnights".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteSize(16 * 1024 * 1024).to_string(), "16MB");
        assert_eq!(ByteSize(1000).to_string(), "1000B");
        assert_eq!(HumanDuration::from_secs(120).to_string(), "2m");
        assert_eq!(HumanDuration::from_secs(3).to_string(), "3s");
        assert_eq!(HumanDuration::from_millis(1500).to_string(), "1500ms");
    }

    #[test]
    fn test_deserialize_string_and_number() {
        #[derive(Deserialize)]
        struct Limits {
            size: ByteSize,
            wait: HumanDuration,
        }

        let parsed: Limits = serde_json::from_str(r#"{"size": "10MB", "wait": "5s"}"#).unwrap();
        assert_eq!(parsed.size.as_u64(), 10 * 1024 * 1024);
        assert_eq!(parsed.wait.as_duration(), Duration::from_secs(5));

        let parsed: Limits = serde_json::from_str(r#"{"size": 1024, "wait": 250}"#).unwrap();
        assert_eq!(parsed.size.as_u64(), 1024);
        assert_eq!(parsed.wait.as_duration(), Duration::from_millis(250));
    }
}
