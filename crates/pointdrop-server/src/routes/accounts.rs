//! Account, balance and admin credit endpoints.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{LedgerDelta, LedgerEntry, PointsAccount};
use crate::routes::AppState;
use crate::store::{BalanceAudit, Ledger};

/// Ledger entries returned with a balance.
const RECENT_ENTRIES: i64 = 10;

/// Maximum length of an admin memo.
const MAX_MEMO_LEN: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountRequest {
    pub account_id: String,
}

/// Request body for an admin recharge credit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargeRequest {
    #[serde(alias = "account_id")]
    pub account_id: String,
    /// Points to credit (a negative value debits).
    pub amount: i64,
    #[serde(default)]
    pub memo: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargeResponse {
    pub ok: bool,
    pub ledger_id: Uuid,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: String,
    pub balance: i64,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub recent_entries: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub account_id: String,
    #[serde(flatten)]
    pub audit: BalanceAudit,
    pub consistent: bool,
}

/// Creates the accounts router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/accounts/{account_id}/balance", get(get_balance))
        .route("/admin/accounts", post(open_account))
        .route("/admin/accounts/{account_id}/audit", get(audit_account))
        .route("/admin/recharge", post(admin_recharge))
        .with_state(state)
}

/// POST /api/v1/admin/accounts
///
/// Opens an account with a zero balance. Opening an existing account returns it unchanged.
async fn open_account(
    State(state): State<AppState>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<Json<PointsAccount>, AppError> {
    let account_id = request.account_id.trim();
    if account_id.is_empty() {
        return Err(AppError::BadRequest("accountId is required".to_string()));
    }

    let account = state.store.open_account(account_id).await?;
    Ok(Json(account))
}

/// GET /api/v1/accounts/{account_id}/balance
async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<BalanceResponse>, AppError> {
    let account = state
        .store
        .account(&account_id)
        .await?
        .ok_or_else(|| AppError::AccountNotFound(account_id.clone()))?;

    let recent_entries = state.store.entries(&account_id, RECENT_ENTRIES).await?;

    Ok(Json(BalanceResponse {
        account_id: account.id,
        balance: account.balance,
        email_verified_at: account.email_verified_at,
        recent_entries,
    }))
}

/// GET /api/v1/admin/accounts/{account_id}/audit
///
/// Compares the cached balance with the sum of the account's ledger entries.
async fn audit_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AuditResponse>, AppError> {
    let audit = state.store.audit(&account_id).await?;
    if !audit.is_consistent() {
        tracing::error!(
            account_id = %account_id,
            balance = audit.balance,
            ledger_sum = audit.ledger_sum,
            "Balance projection diverged from ledger"
        );
    }

    Ok(Json(AuditResponse {
        account_id,
        consistent: audit.is_consistent(),
        audit,
    }))
}

/// POST /api/v1/admin/recharge
///
/// Credits points outside the payment flow (support adjustments, promotions).
async fn admin_recharge(
    State(state): State<AppState>,
    Json(request): Json<RechargeRequest>,
) -> Result<Json<RechargeResponse>, AppError> {
    // Step 1: Validate input
    if request.amount == 0 {
        return Err(AppError::BadRequest("amount must be non-zero".to_string()));
    }
    let memo = request.memo.trim();
    if memo.len() > MAX_MEMO_LEN {
        return Err(AppError::BadRequest(format!(
            "memo must be at most {} bytes",
            MAX_MEMO_LEN
        )));
    }

    // Step 2: Apply the delta
    let applied = state
        .store
        .apply_delta(LedgerDelta::admin(&request.account_id, request.amount, memo))
        .await?;

    tracing::info!(
        account_id = %request.account_id,
        amount = request.amount,
        balance_after = applied.balance_after,
        "Admin recharge applied"
    );

    Ok(Json(RechargeResponse {
        ok: true,
        ledger_id: applied.ledger_id,
        balance: applied.balance_after,
    }))
}
