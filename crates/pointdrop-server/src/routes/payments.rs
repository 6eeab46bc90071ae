//! Checkout, gateway callback and order endpoints.

use axum::{
    extract::{Path, State},
    response::Redirect,
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use pointdrop_checkmac::GatewayFields;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::models::{GatewayEcho, PaymentOrder};
use crate::payments::{authenticate, start_checkout, CheckoutForm, CheckoutRequest, PaymentNotice};
use crate::reconcile::{ReconcileError, Settlement};
use crate::routes::{redirect_with, AppState};
use crate::store::{OrderStore, StoreError};

/// Acknowledgement the gateway expects once a callback is committed.
const ACK_OK: &str = "1|OK";
/// Tells the gateway to redeliver later; another task holds this trade number.
const ACK_IN_PROGRESS: &str = "0|Processing";
const ACK_ORDER_NOT_FOUND: &str = "0|OrderNotFound";

/// Request body for starting a checkout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    #[serde(alias = "account_id")]
    pub account_id: String,
    /// Amount in currency units, as a JSON number or decimal string.
    pub amount: serde_json::Value,
    pub points: i64,
    pub description: String,
    pub item_name: String,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub custom_fields: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// `TradeStatus` reported by the gateway, if it was asked.
    pub trade_status: Option<String>,
    pub order: PaymentOrder,
}

/// Creates the public payments router, mounted under `/payments`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/notify", post(gateway_notify))
        .route("/payment-info", post(gateway_payment_info))
        .route("/result", post(gateway_result))
        .route("/orders/{trade_no}", get(get_order))
        .with_state(state)
}

/// Creates the admin payments router.
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/orders/{trade_no}/sync", post(sync_order))
        .with_state(state)
}

/// Verifies the signature and merchant of an inbound gateway form.
fn check_callback(state: &AppState, fields: &GatewayFields) -> Result<(), AppError> {
    authenticate(fields, &state.checkout.keys)?;

    if let Some(merchant_id) = fields.get("MerchantID") {
        if merchant_id != state.checkout.merchant_id {
            warn!(
                target: "pointdrop_server::security",
                merchant_id = %merchant_id,
                "Gateway callback for another merchant"
            );
            return Err(AppError::BadRequest("Unknown MerchantID".to_string()));
        }
    }
    Ok(())
}

/// POST /api/v1/payments/checkout
///
/// Creates a PENDING order and returns the signed form the browser posts to the gateway.
async fn checkout(
    State(state): State<AppState>,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<CheckoutForm>, AppError> {
    let amount = match body.amount {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => {
            return Err(AppError::BadRequest(format!(
                "amount must be a number or decimal string, got {}",
                other
            )))
        }
    };

    let request = CheckoutRequest {
        account_id: body.account_id,
        amount,
        points: body.points,
        description: body.description,
        item_name: body.item_name,
        return_url: body.return_url,
        custom_fields: body.custom_fields,
    };

    let form = start_checkout(state.store.as_ref(), &state.checkout, request, Utc::now()).await?;
    Ok(Json(form))
}

/// POST /api/v1/payments/notify
///
/// Server-to-server payment result. Answers `1|OK` only after the order is settled.
async fn gateway_notify(
    State(state): State<AppState>,
    Form(fields): Form<GatewayFields>,
) -> Result<&'static str, AppError> {
    // Step 1: Verify before touching the order
    check_callback(&state, &fields)?;

    // Step 2: Read the notice
    let notice =
        PaymentNotice::from_callback(&fields).map_err(|e| AppError::BadRequest(e.to_string()))?;

    // Step 3: Credit and settle
    match state.queue.process(&notice).await {
        Ok(Settlement::InFlight) => Ok(ACK_IN_PROGRESS),
        Ok(_) => Ok(ACK_OK),
        Err(ReconcileError::Store(StoreError::OrderNotFound(trade_no))) => {
            warn!(trade_no = %trade_no, "Payment notice for unknown order");
            Ok(ACK_ORDER_NOT_FOUND)
        }
        Err(e) => Err(e.into()),
    }
}

/// POST /api/v1/payments/payment-info
///
/// Offline payment instructions (ATM account, store code). Never changes the order status.
async fn gateway_payment_info(
    State(state): State<AppState>,
    Form(fields): Form<GatewayFields>,
) -> Result<&'static str, AppError> {
    check_callback(&state, &fields)?;

    let trade_no = fields
        .get_non_empty("MerchantTradeNo")
        .ok_or_else(|| AppError::BadRequest("missing MerchantTradeNo".to_string()))?;

    match state
        .store
        .record_payment_info(trade_no, &GatewayEcho::from_fields(&fields))
        .await
    {
        Ok(_) => Ok(ACK_OK),
        Err(StoreError::OrderNotFound(_)) => {
            warn!(trade_no = %trade_no, "Payment info for unknown order");
            Ok(ACK_ORDER_NOT_FOUND)
        }
        Err(e) => Err(e.into()),
    }
}

/// POST /api/v1/payments/result
///
/// Browser post-back after payment. Settles like the notify callback, then
/// redirects to the result page.
async fn gateway_result(
    State(state): State<AppState>,
    Form(fields): Form<GatewayFields>,
) -> Result<Redirect, AppError> {
    check_callback(&state, &fields)?;

    let notice =
        PaymentNotice::from_callback(&fields).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let status = match state.queue.process(&notice).await {
        Ok(settlement) => settlement
            .order()
            .map(|order| order.status.as_str())
            .unwrap_or("pending"),
        Err(e @ ReconcileError::Exhausted { .. }) => {
            warn!(trade_no = %notice.trade_no, error = %e, "Result page shown before settlement");
            "pending"
        }
        Err(e) => return Err(e.into()),
    };

    Ok(redirect_with(
        state.public_base_url(),
        "/recharge/result",
        &[("tradeNo", notice.trade_no.as_str()), ("status", status)],
    ))
}

/// GET /api/v1/payments/orders/{trade_no}
async fn get_order(
    State(state): State<AppState>,
    Path(trade_no): Path<String>,
) -> Result<Json<PaymentOrder>, AppError> {
    let order = state
        .store
        .get_order(&trade_no)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", trade_no)))?;

    Ok(Json(order))
}

/// POST /api/v1/admin/orders/{trade_no}/sync
///
/// Asks the gateway for the trade's status and settles a paid trade.
async fn sync_order(
    State(state): State<AppState>,
    Path(trade_no): Path<String>,
) -> Result<Json<SyncResponse>, AppError> {
    // Step 1: Load the order; terminal orders need no query
    let order = state
        .store
        .get_order(&trade_no)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", trade_no)))?;

    if order.status.is_terminal() {
        return Ok(Json(SyncResponse {
            trade_status: None,
            order,
        }));
    }

    // Step 2: Query the gateway (signature verified by the client)
    let fields = state.gateway.query_trade(&trade_no).await?;
    if fields.get("MerchantTradeNo") != Some(trade_no.as_str()) {
        return Err(AppError::GatewayUnreachable(format!(
            "trade query for {} answered for {}",
            trade_no,
            fields.get("MerchantTradeNo").unwrap_or("<none>")
        )));
    }
    let trade_status = fields.get("TradeStatus").map(str::to_string);

    // Step 3: Feed a paid trade through reconciliation
    let notice = PaymentNotice::from_trade_query(&fields)
        .map_err(|e| AppError::GatewayUnreachable(e.to_string()))?;

    let order = match notice {
        Some(notice) => {
            let settlement = state.queue.process(&notice).await?;
            settlement.order().cloned().unwrap_or(order)
        }
        None => order,
    };

    Ok(Json(SyncResponse {
        trade_status,
        order,
    }))
}
