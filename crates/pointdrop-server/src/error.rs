//! Error types for the pointdrop server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::gateway::GatewayError;
use crate::payments::CheckoutError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Insufficient points: have {balance}, need {required}")]
    InsufficientPoints { balance: i64, required: i64 },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Duplicate trade number: {0}")]
    DuplicateTradeNo(String),

    #[error("CheckMacValue verification failed")]
    SignatureMismatch,

    #[error("Payment gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// JSON body for taxonomy errors clients branch on.
fn tagged(status: StatusCode, tag: &str, message: String) -> Response {
    (
        status,
        Json(json!({ "ok": false, "error": tag, "message": message })),
    )
        .into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            AppError::InsufficientPoints { balance, required } => tagged(
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_POINTS",
                format!("Balance {} is below the {} points required", balance, required),
            ),
            AppError::AccountNotFound(id) => tagged(
                StatusCode::NOT_FOUND,
                "ACCOUNT_NOT_FOUND",
                format!("Account {} does not exist", id),
            ),
            AppError::DuplicateTradeNo(trade_no) => tagged(
                StatusCode::CONFLICT,
                "DUPLICATE_TRADE_NO",
                format!("Trade number {} already exists", trade_no),
            ),
            AppError::SignatureMismatch => {
                (StatusCode::BAD_REQUEST, "CheckMacValue verification failed").into_response()
            }
            AppError::GatewayUnreachable(detail) => {
                tracing::error!("Payment gateway error: {}", detail);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "ok": false,
                        "error": "GATEWAY_UNREACHABLE",
                        "message": "Payment gateway is unavailable, please try again later",
                        "detail": detail,
                    })),
                )
                    .into_response()
            }
            AppError::Unavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                tagged(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Temporarily unable to complete the request".to_string(),
                )
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => AppError::AccountNotFound(id),
            StoreError::InsufficientBalance { balance, required } => {
                AppError::InsufficientPoints { balance, required }
            }
            StoreError::InvalidDelta(msg) => AppError::BadRequest(msg),
            StoreError::DuplicateTradeNo(trade_no) => AppError::DuplicateTradeNo(trade_no),
            StoreError::OrderNotFound(trade_no) => {
                AppError::NotFound(format!("Order {} not found", trade_no))
            }
            StoreError::OrderFailed(trade_no) => {
                AppError::BadRequest(format!("Order {} has already failed", trade_no))
            }
            StoreError::Transient(msg) => AppError::Unavailable(msg),
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            e @ ReconcileError::Exhausted { .. } => AppError::Unavailable(e.to_string()),
            ReconcileError::Store(e) => e.into(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::GatewayUnreachable(err.to_string())
    }
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::InvalidAmount(msg) | CheckoutError::InvalidRequest(msg) => {
                AppError::BadRequest(msg)
            }
            CheckoutError::Store(e) => e.into(),
        }
    }
}

impl From<pointdrop_checkmac::CheckMacError> for AppError {
    fn from(_: pointdrop_checkmac::CheckMacError) -> Self {
        AppError::SignatureMismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insufficient_points_is_402() {
        let response = AppError::from(StoreError::InsufficientBalance {
            balance: 2,
            required: 5,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "INSUFFICIENT_POINTS");
    }

    #[tokio::test]
    async fn test_gateway_error_keeps_detail() {
        let response =
            AppError::from(GatewayError::Unreachable("connect timeout".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = body_json(response).await;
        assert_eq!(body["error"], "GATEWAY_UNREACHABLE");
        assert!(body["detail"].as_str().unwrap().contains("connect timeout"));
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::from(StoreError::AccountNotFound("a".into())), StatusCode::NOT_FOUND),
            (AppError::from(StoreError::DuplicateTradeNo("t".into())), StatusCode::CONFLICT),
            (AppError::from(StoreError::Transient("lock".into())), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::from(StoreError::OrderNotFound("t".into())), StatusCode::NOT_FOUND),
            (AppError::SignatureMismatch, StatusCode::BAD_REQUEST),
            (
                AppError::from(CheckoutError::InvalidAmount("x".into())),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
