//! Storage traits for the ledger, payment orders and verification tokens.
//!
//! Every balance and state-transition guard is enforced inside the
//! implementations, at the data-access boundary, so concurrent callers cannot
//! race past an advisory check.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    Consumed, DedupKey, GatewayEcho, LedgerDelta, LedgerEntry, NewPaymentOrder, PaymentOrder,
    PointsAccount,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Postgres SQLSTATE codes worth retrying.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement timeout)
];

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("duplicate trade number: {0}")]
    DuplicateTradeNo(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order {0} has already failed")]
    OrderFailed(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    /// Returns true for failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| TRANSIENT_SQLSTATES.contains(&&*code))
                .unwrap_or(false),
            _ => false,
        };

        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

/// Outcome of a committed ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Applied {
    pub ledger_id: Uuid,
    pub balance_after: i64,
}

/// Outcome of billing one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillOutcome {
    /// The download was charged.
    Charged { cost: i64, applied: Applied },
    /// This key was already charged in its bucket; nothing was written.
    Deduped,
}

/// Cached balance next to the ledger sum it projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceAudit {
    pub balance: i64,
    pub ledger_sum: i64,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// Points ledger and balance projection.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates an account with a zero balance. Opening an existing account is a no-op.
    async fn open_account(&self, account_id: &str) -> StoreResult<PointsAccount>;

    async fn account(&self, account_id: &str) -> StoreResult<Option<PointsAccount>>;

    /// Appends one ledger entry and moves the balance by the same delta, atomically.
    ///
    /// Fails with `AccountNotFound` if the account does not exist and with
    /// `InsufficientBalance` if the balance would go negative.
    async fn apply_delta(&self, delta: LedgerDelta) -> StoreResult<Applied>;

    /// Charges `cost` points for the download identified by `key`.
    ///
    /// Claiming the key, checking the balance, writing the debit and recording
    /// the charge commit together. A key already charged yields `Deduped`; an
    /// insufficient balance leaves the key unclaimed.
    async fn bill_download(&self, key: &DedupKey, cost: i64) -> StoreResult<BillOutcome>;

    /// Most recent ledger entries for an account, newest first.
    async fn entries(&self, account_id: &str, limit: i64) -> StoreResult<Vec<LedgerEntry>>;

    /// Compares the cached balance with the ledger sum.
    async fn audit(&self, account_id: &str) -> StoreResult<BalanceAudit>;
}

/// Payment order state machine.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Creates a PENDING order. Fails with `DuplicateTradeNo` if the trade number exists.
    async fn create_order(&self, order: NewPaymentOrder) -> StoreResult<PaymentOrder>;

    async fn get_order(&self, trade_no: &str) -> StoreResult<Option<PaymentOrder>>;

    /// Stores gateway payment instructions on a PENDING order. Never changes
    /// the status; terminal orders are returned unchanged.
    async fn record_payment_info(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
    ) -> StoreResult<PaymentOrder>;

    /// Credits the order's points to its account, at most once per order.
    ///
    /// The credit is keyed by the `recharge:<trade_no>` reason: if it already
    /// exists the original result is returned and nothing is written.
    async fn credit_order(&self, trade_no: &str) -> StoreResult<Applied>;

    /// The committed `recharge:<trade_no>` credit, if any. Never writes.
    async fn existing_credit(&self, trade_no: &str) -> StoreResult<Option<Applied>>;

    /// Moves a PENDING order to PAID. Terminal orders are returned unchanged.
    async fn mark_paid(
        &self,
        trade_no: &str,
        echo: &GatewayEcho,
        applied: Applied,
    ) -> StoreResult<PaymentOrder>;

    /// Moves a PENDING order to FAILED. Terminal orders, and orders whose
    /// credit already committed, are returned unchanged.
    async fn mark_failed(&self, trade_no: &str, echo: &GatewayEcho) -> StoreResult<PaymentOrder>;

    /// PENDING orders created at or before `created_before`, oldest first.
    async fn list_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentOrder>>;
}

/// Single-use email verification tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Stores a token for `subject`, replacing any previous one.
    async fn issue_token(
        &self,
        subject: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Looks up a token by hash and deletes it whatever the outcome.
    ///
    /// On success the subject's account is stamped as email-verified.
    async fn consume_token(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<Consumed>;
}

/// Everything the API needs from storage.
pub trait Store: Ledger + OrderStore + TokenStore {}

impl<T: Ledger + OrderStore + TokenStore> Store for T {}
