//! Download billing endpoint.

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::bill;
use crate::error::AppError;
use crate::models::Platform;
use crate::routes::AppState;
use crate::store::BillOutcome;

/// Request body for billing one download.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillDownloadRequest {
    #[serde(alias = "account_id")]
    pub account_id: String,
    #[serde(alias = "link_id")]
    pub link_id: String,
    pub platform: String,
}

/// Billing result. A dedup hit is a success with `deduped: true`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillDownloadResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_id: Option<Uuid>,
}

/// Creates the billing router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/downloads", post(bill_download))
        .with_state(state)
}

/// POST /api/v1/billing/downloads
///
/// Charges the account for one download of a link. Repeat requests for the
/// same (account, link, platform) inside one minute are not charged again.
async fn bill_download(
    State(state): State<AppState>,
    Json(request): Json<BillDownloadRequest>,
) -> Result<Json<BillDownloadResponse>, AppError> {
    // Step 1: Validate input
    if request.account_id.trim().is_empty() || request.link_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "accountId and linkId are required".to_string(),
        ));
    }
    let platform: Platform = request
        .platform
        .parse()
        .map_err(|e| AppError::BadRequest(format!("{}", e)))?;

    // Step 2: Claim, check and debit in one store transaction
    let outcome = bill(
        state.store.as_ref(),
        &request.account_id,
        &request.link_id,
        platform,
        Utc::now(),
    )
    .await?;

    let response = match outcome {
        BillOutcome::Deduped => BillDownloadResponse {
            ok: true,
            deduped: Some(true),
            charged: None,
            cost: None,
            balance: None,
            ledger_id: None,
        },
        BillOutcome::Charged { cost, applied } => BillDownloadResponse {
            ok: true,
            deduped: None,
            charged: Some(true),
            cost: Some(cost),
            balance: Some(applied.balance_after),
            ledger_id: Some(applied.ledger_id),
        },
    };

    Ok(Json(response))
}
