//! Points account model holding the cached balance projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A points account. `balance` always equals the sum of the account's ledger deltas.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PointsAccount {
    /// Opaque account identifier.
    pub id: String,
    /// Current balance in points.
    pub balance: i64,
    /// When the account's email address was verified (null if never).
    pub email_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PointsAccount {
    /// Creates an empty account.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            balance: 0,
            email_verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}
