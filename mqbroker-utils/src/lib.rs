//! Small helpers shared by the broker crates.
//!
//! ```
//! use mqbroker_utils::{to_bytesize, to_duration};
//!
//! assert_eq!(to_duration("1m30s").unwrap().as_secs(), 90);
//! assert_eq!(to_bytesize("1M").unwrap(), 1024 * 1024);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1024 * 1024;
const BYTESIZE_G: usize = 1024 * 1024 * 1024;

/// Byte count that (de)serializes as "512K", "1M", "2G512M", ...
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut out = String::new();
        for (unit, size) in [("G", BYTESIZE_G), ("M", BYTESIZE_M), ("K", BYTESIZE_K)] {
            if v >= size {
                out.push_str(&format!("{}{}", v / size, unit));
                v %= size;
            }
        }
        if v > 0 || out.is_empty() {
            out.push_str(&format!("{}B", v));
        }
        out
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        to_bytesize(&v).map(Bytesize).map_err(de::Error::custom)
    }
}

/// Splits "1h30m" style text into `(number, unit)` pairs.
fn split_units<'a>(text: &'a str, units: &[&'a str]) -> Result<Vec<(u64, &'a str)>> {
    let mut parts = Vec::new();
    let mut rest = text.trim();
    if rest.is_empty() {
        return Err(anyhow!("empty value"));
    }
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(anyhow!("invalid value: {:?}", text));
        }
        let n = rest[..digits].parse::<u64>()?;
        rest = &rest[digits..];
        let unit = units
            .iter()
            .find(|u| rest.starts_with(**u))
            .ok_or_else(|| anyhow!("invalid unit in {:?}, expected one of {:?}", text, units))?;
        rest = &rest[unit.len()..];
        parts.push((n, *unit));
    }
    Ok(parts)
}

/// Parses "1G", "512K", "2G512M" or "100B"; units are case-insensitive.
pub fn to_bytesize(text: &str) -> Result<usize> {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    split_units(&text, &["G", "M", "K", "B"])?
        .into_iter()
        .map(|(v, unit)| {
            let v = v as usize;
            match unit {
                "G" => v * BYTESIZE_G,
                "M" => v * BYTESIZE_M,
                "K" => v * BYTESIZE_K,
                _ => v,
            }
        })
        .try_fold(0usize, |acc, v| acc.checked_add(v).ok_or_else(|| anyhow!("byte size overflow")))
}

/// Parses "500ms", "20s", "1h30m", "2d"; a bare "0" means zero.
pub fn to_duration(text: &str) -> Result<Duration> {
    if text.trim() == "0" {
        return Ok(Duration::ZERO);
    }
    let text = text.to_lowercase();
    let ms = split_units(&text, &["ms", "s", "m", "h", "d"])?
        .into_iter()
        .map(|(v, unit)| match unit {
            "ms" => v,
            "s" => v * 1_000,
            "m" => v * 60_000,
            "h" => v * 3_600_000,
            _ => v * 86_400_000,
        })
        .sum();
    Ok(Duration::from_millis(ms))
}

/// serde helper for duration fields written as "20s".
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    to_duration(&v).map_err(de::Error::custom)
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    use chrono::TimeZone;
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) if t.timestamp_millis() > 0 => {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(to_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(to_duration("1h30m15s").unwrap(), Duration::from_secs(5415));
        assert_eq!(to_duration("2d").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(to_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(to_duration("0s").unwrap(), Duration::ZERO);
        assert!(to_duration("").is_err());
        assert!(to_duration("10x").is_err());
        assert!(to_duration("s").is_err());
    }

    #[test]
    fn test_to_bytesize() {
        assert_eq!(to_bytesize("1M").unwrap(), 1024 * 1024);
        assert_eq!(to_bytesize("2G512M").unwrap(), 2_684_354_560);
        assert_eq!(to_bytesize("64kb").unwrap(), 64 * 1024);
        assert_eq!(to_bytesize("100B").unwrap(), 100);
        assert!(to_bytesize("12").is_err());
        assert_eq!(Bytesize(1024 * 1024 + 1).string(), "1M1B");
        assert_eq!(Bytesize(0).string(), "0B");
    }

    #[test]
    fn test_deserialize_helpers() {
        #[derive(Deserialize)]
        struct Conf {
            #[serde(deserialize_with = "deserialize_duration")]
            interval: Duration,
            size: Bytesize,
        }
        let c: Conf = serde_json::from_str(r#"{"interval":"1m","size":"2K"}"#).unwrap();
        assert_eq!(c.interval, Duration::from_secs(60));
        assert_eq!(c.size.as_usize(), 2048);
        assert!(serde_json::from_str::<Conf>(r#"{"interval":"1q","size":"2K"}"#).is_err());
    }

    #[test]
    fn test_timestamp() {
        let now = timestamp_millis();
        assert!(now > 0);
        assert!(!format_timestamp_millis(now).is_empty());
        assert!(format_timestamp_millis(0).is_empty());
    }
}
