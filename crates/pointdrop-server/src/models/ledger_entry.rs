//! Points ledger model: immutable, signed point movements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::download_charge::DedupKey;

/// Why a ledger entry was written. Stored as a short text tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LedgerReason {
    /// A billed download (`download`).
    Download,
    /// Credit from a paid payment order (`recharge:<trade_no>`).
    Recharge(String),
    /// Manual credit or debit by an operator (`admin:<memo>`).
    Admin(String),
    /// Any tag this build does not recognise.
    Other(String),
}

impl LedgerReason {
    /// Returns the payment order trade number for recharge entries.
    pub fn trade_no(&self) -> Option<&str> {
        match self {
            LedgerReason::Recharge(trade_no) => Some(trade_no),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerReason::Download => f.write_str("download"),
            LedgerReason::Recharge(trade_no) => write!(f, "recharge:{}", trade_no),
            LedgerReason::Admin(memo) => write!(f, "admin:{}", memo),
            LedgerReason::Other(tag) => f.write_str(tag),
        }
    }
}

impl FromStr for LedgerReason {
    type Err = std::convert::Infallible;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Ok(if tag == "download" {
            LedgerReason::Download
        } else if let Some(trade_no) = tag.strip_prefix("recharge:") {
            LedgerReason::Recharge(trade_no.to_string())
        } else if let Some(memo) = tag.strip_prefix("admin:") {
            LedgerReason::Admin(memo.to_string())
        } else {
            LedgerReason::Other(tag.to_string())
        })
    }
}

impl Serialize for LedgerReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LedgerReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(tag.parse().unwrap_or(LedgerReason::Other(tag)))
    }
}

/// Represents an immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Unique identifier for this ledger entry.
    pub id: Uuid,
    /// Account whose balance moved.
    pub account_id: String,
    /// Signed point movement, never zero.
    pub delta: i64,
    /// Account balance right after this entry was applied.
    pub balance_after: i64,
    /// Audit tag, see [`LedgerReason`].
    pub reason: String,
    /// Download link for download charges.
    pub link_id: Option<String>,
    /// Platform tag for download charges.
    pub platform: Option<String>,
    /// Minute bucket for download charges.
    pub bucket: Option<i64>,
    /// When this entry was written (immutable).
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn reason(&self) -> LedgerReason {
        self.reason
            .parse()
            .unwrap_or_else(|_| LedgerReason::Other(self.reason.clone()))
    }
}

/// A point movement to apply to one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDelta {
    pub account_id: String,
    pub delta: i64,
    pub reason: LedgerReason,
    pub link_id: Option<String>,
    pub platform: Option<String>,
    pub bucket: Option<i64>,
}

impl LedgerDelta {
    /// Debit for one billed download.
    pub fn download(key: &DedupKey, cost: i64) -> Self {
        Self {
            account_id: key.account_id.clone(),
            delta: -cost,
            reason: LedgerReason::Download,
            link_id: Some(key.link_id.clone()),
            platform: Some(key.platform.to_string()),
            bucket: Some(key.bucket),
        }
    }

    /// Credit for a paid payment order.
    pub fn recharge(account_id: impl Into<String>, trade_no: impl Into<String>, points: i64) -> Self {
        Self {
            account_id: account_id.into(),
            delta: points,
            reason: LedgerReason::Recharge(trade_no.into()),
            link_id: None,
            platform: None,
            bucket: None,
        }
    }

    /// Operator adjustment (positive or negative).
    pub fn admin(account_id: impl Into<String>, delta: i64, memo: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            delta,
            reason: LedgerReason::Admin(memo.into()),
            link_id: None,
            platform: None,
            bucket: None,
        }
    }

    /// Materialises the entry as it will be stored.
    pub fn into_entry(self, id: Uuid, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            account_id: self.account_id,
            delta: self.delta,
            balance_after,
            reason: self.reason.to_string(),
            link_id: self.link_id,
            platform: self.platform,
            bucket: self.bucket,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    #[test]
    fn test_reason_tags() {
        assert_eq!(LedgerReason::Download.to_string(), "download");
        assert_eq!(
            LedgerReason::Recharge("PD261016123045ABCDEF".into()).to_string(),
            "recharge:PD261016123045ABCDEF"
        );
        assert_eq!(LedgerReason::Admin("promo".into()).to_string(), "admin:promo");
    }

    #[test]
    fn test_reason_parse() {
        assert_eq!("download".parse::<LedgerReason>().unwrap(), LedgerReason::Download);
        assert_eq!(
            "recharge:T1".parse::<LedgerReason>().unwrap(),
            LedgerReason::Recharge("T1".into())
        );
        assert_eq!(
            "admin:refund ticket 9".parse::<LedgerReason>().unwrap(),
            LedgerReason::Admin("refund ticket 9".into())
        );
        assert_eq!(
            "legacy".parse::<LedgerReason>().unwrap(),
            LedgerReason::Other("legacy".into())
        );
    }

    #[test]
    fn test_reason_serializes_as_tag() {
        let json = serde_json::to_string(&LedgerReason::Recharge("T1".into())).unwrap();
        assert_eq!(json, "\"recharge:T1\"");
        let parsed: LedgerReason = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trade_no(), Some("T1"));
    }

    #[test]
    fn test_download_delta() {
        let key = DedupKey::new("acct_1", "link_9", Platform::Ipa, 29_000_000);
        let delta = LedgerDelta::download(&key, 5);
        assert_eq!(delta.delta, -5);
        assert_eq!(delta.reason, LedgerReason::Download);
        assert_eq!(delta.link_id.as_deref(), Some("link_9"));
        assert_eq!(delta.platform.as_deref(), Some("ipa"));
        assert_eq!(delta.bucket, Some(29_000_000));
    }

    #[test]
    fn test_recharge_delta() {
        let delta = LedgerDelta::recharge("acct_1", "T1", 1000);
        assert_eq!(delta.delta, 1000);
        assert_eq!(delta.reason.trade_no(), Some("T1"));
        assert!(delta.link_id.is_none());
    }

    #[test]
    fn test_into_entry_keeps_fields() {
        let id = Uuid::new_v4();
        let entry = LedgerDelta::admin("acct_1", -2, "correction").into_entry(id, 8);
        assert_eq!(entry.id, id);
        assert_eq!(entry.delta, -2);
        assert_eq!(entry.balance_after, 8);
        assert_eq!(entry.reason(), LedgerReason::Admin("correction".into()));
    }
}
