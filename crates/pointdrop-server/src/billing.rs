//! Download billing.
//!
//! A download costs [`Platform::cost`] points and is charged at most once per
//! (account, link, platform, minute). Repeat requests inside the same minute are
//! successes that write nothing.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::models::{DedupKey, Platform};
use crate::store::{BillOutcome, Ledger, StoreError, StoreResult};

/// Bills one download happening at `at`.
pub async fn bill<L: Ledger + ?Sized>(
    ledger: &L,
    account_id: &str,
    link_id: &str,
    platform: Platform,
    at: DateTime<Utc>,
) -> StoreResult<BillOutcome> {
    let key = DedupKey::at(account_id, link_id, platform, at);
    let cost = platform.cost();

    match ledger.bill_download(&key, cost).await {
        Ok(BillOutcome::Deduped) => {
            debug!(
                account_id = %account_id,
                link_id = %link_id,
                platform = %platform,
                bucket = key.bucket,
                "Download already billed in this bucket"
            );
            Ok(BillOutcome::Deduped)
        }
        Ok(charged @ BillOutcome::Charged { applied, .. }) => {
            debug!(
                account_id = %account_id,
                link_id = %link_id,
                platform = %platform,
                cost,
                balance_after = applied.balance_after,
                "Download billed"
            );
            Ok(charged)
        }
        Err(StoreError::InsufficientBalance { balance, required }) => {
            info!(
                account_id = %account_id,
                link_id = %link_id,
                balance,
                required,
                "Insufficient points for download"
            );
            Err(StoreError::InsufficientBalance { balance, required })
        }
        Err(e) => Err(e),
    }
}
