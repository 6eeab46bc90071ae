//! Download billing dedup model.
//!
//! A download is billed at most once per (account, link, platform, minute).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a dedup bucket in seconds.
pub const BUCKET_SECONDS: i64 = 60;

/// Points charged for an iOS build download.
pub const IPA_COST: i64 = 5;

/// Points charged for any other supported platform.
pub const DEFAULT_COST: i64 = 3;

/// Build platforms that can be billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// iOS application archive.
    Ipa,
    /// Android package.
    Apk,
}

impl Platform {
    /// Points charged for one download on this platform.
    pub fn cost(self) -> i64 {
        match self {
            Platform::Ipa => IPA_COST,
            Platform::Apk => DEFAULT_COST,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ipa => "ipa",
            Platform::Apk => "apk",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for platform tags that cannot be billed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipa" => Ok(Platform::Ipa),
            "apk" => Ok(Platform::Apk),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// Returns the dedup bucket (whole minutes since the Unix epoch) containing `at`.
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(BUCKET_SECONDS)
}

/// Composite key of one billable download event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub account_id: String,
    pub link_id: String,
    pub platform: Platform,
    pub bucket: i64,
}

impl DedupKey {
    pub fn new(
        account_id: impl Into<String>,
        link_id: impl Into<String>,
        platform: Platform,
        bucket: i64,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            link_id: link_id.into(),
            platform,
            bucket,
        }
    }

    /// Key for a download happening at `at`.
    pub fn at(
        account_id: impl Into<String>,
        link_id: impl Into<String>,
        platform: Platform,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(account_id, link_id, platform, minute_bucket(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_platform_costs() {
        assert_eq!(Platform::Ipa.cost(), 5);
        assert_eq!(Platform::Apk.cost(), 3);
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("ipa".parse::<Platform>(), Ok(Platform::Ipa));
        assert_eq!(" APK ".parse::<Platform>(), Ok(Platform::Apk));
        assert_eq!(
            "exe".parse::<Platform>(),
            Err(UnknownPlatform("exe".to_string()))
        );
    }

    #[test]
    fn test_platform_serialization() {
        assert_eq!(serde_json::to_string(&Platform::Ipa).unwrap(), "\"ipa\"");
        assert_eq!(
            serde_json::from_str::<Platform>("\"apk\"").unwrap(),
            Platform::Apk
        );
    }

    #[test]
    fn test_minute_bucket_boundaries() {
        let start = Utc.with_ymd_and_hms(2026, 10, 16, 12, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 10, 16, 12, 30, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 10, 16, 12, 31, 0).unwrap();
        assert_eq!(minute_bucket(start), start.timestamp() / 60);
        assert_eq!(minute_bucket(start), minute_bucket(end));
        assert_eq!(minute_bucket(next), minute_bucket(start) + 1);
    }

    #[test]
    fn test_minute_bucket_before_epoch() {
        let before = Utc.timestamp_opt(-1, 0).unwrap();
        assert_eq!(minute_bucket(before), -1);
    }

    #[test]
    fn test_dedup_key_at() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 12, 30, 15).unwrap();
        let key = DedupKey::at("acct_1", "link_1", Platform::Apk, at);
        assert_eq!(key.bucket, minute_bucket(at));
        assert_eq!(key, DedupKey::new("acct_1", "link_1", Platform::Apk, key.bucket));
    }
}
