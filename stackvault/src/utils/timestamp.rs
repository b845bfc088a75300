//! Second-resolution timestamps for backup sets and container records.
//!
//! Storage uses `YYYYMMDD_HHMMSS` (UTC), which sorts lexicographically in
//! chronological order. Ordering in code always goes through `NaiveDateTime`.

use chrono::{Duration, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::utils::errors::VaultError;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Length of a formatted timestamp.
pub const TIMESTAMP_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupTimestamp(NaiveDateTime);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now().naive_utc())
    }

    /// Truncates to whole seconds.
    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self(dt.with_nanosecond(0).unwrap_or(dt))
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }

    pub fn older_than(&self, now: BackupTimestamp, window: Duration) -> bool {
        now.0 - self.0 > window
    }

    pub fn minus(&self, window: Duration) -> Self {
        Self(self.0 - window)
    }

    /// Splits `<stem>_<timestamp>` into its stem and timestamp.
    pub fn split_suffix(name: &str) -> Option<(&str, BackupTimestamp)> {
        if name.len() < TIMESTAMP_LEN + 2 {
            return None;
        }
        let split = name.len() - TIMESTAMP_LEN;
        if name.as_bytes()[split - 1] != b'_' {
            return None;
        }
        // `_` is ASCII, so both halves start on a char boundary
        let ts = name[split..].parse().ok()?;
        Some((&name[..split - 1], ts))
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for BackupTimestamp {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(Self)
            .map_err(|e| VaultError::Config(format!("invalid timestamp '{}': {}", s, e)))
    }
}

impl Serialize for BackupTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackupTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ts: BackupTimestamp = "20240102_030405".parse().unwrap();
        assert_eq!(ts.to_string(), "20240102_030405");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("2024-01-02".parse::<BackupTimestamp>().is_err());
        assert!("20241302_030405".parse::<BackupTimestamp>().is_err());
    }

    #[test]
    fn test_ordering_matches_lexicographic() {
        let raw = ["20231231_235959", "20240101_000000", "20240101_000001"];
        let parsed: Vec<BackupTimestamp> = raw.iter().map(|s| s.parse().unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_split_suffix() {
        let (stem, ts) = BackupTimestamp::split_suffix("my_db_1_20240101_101010").unwrap();
        assert_eq!(stem, "my_db_1");
        assert_eq!(ts.to_string(), "20240101_101010");
        assert!(BackupTimestamp::split_suffix("web").is_none());
        assert!(BackupTimestamp::split_suffix("web-20240101_101010").is_none());
        assert!(BackupTimestamp::split_suffix("aé12345678901234").is_none());
        assert!(BackupTimestamp::split_suffix("café_20240101_101010").is_some());
    }

    #[test]
    fn test_older_than() {
        let now: BackupTimestamp = "20240110_000000".parse().unwrap();
        let old: BackupTimestamp = "20240102_000000".parse().unwrap();
        assert!(old.older_than(now, Duration::days(7)));
        assert!(!old.older_than(now, Duration::days(8)));
    }

    #[test]
    fn test_serde_as_string() {
        let ts: BackupTimestamp = "20240102_030405".parse().unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"20240102_030405\"");
        let back: BackupTimestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
