//! Email verification endpoints.

use axum::{
    extract::{Query, State},
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;

use crate::error::AppError;
use crate::models::IssuedToken;
use crate::routes::{redirect_with, AppState};
use crate::store::Ledger;
use crate::verification::{consume, issue};

const STATUS_PAGE: &str = "/verify-email/status";

#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    /// Account id the token verifies.
    pub subject: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub token: String,
}

/// Creates the verification router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/verification", post(issue_token))
        .route("/verify-email", get(verify_email))
        .with_state(state)
}

/// POST /api/v1/admin/verification
///
/// Issues a token for an existing account. The caller delivers it by email.
async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueRequest>,
) -> Result<Json<IssuedToken>, AppError> {
    let subject = request.subject.trim();
    if subject.is_empty() {
        return Err(AppError::BadRequest("subject is required".to_string()));
    }

    if state.store.account(subject).await?.is_none() {
        return Err(AppError::AccountNotFound(subject.to_string()));
    }

    let issued = issue(state.store.as_ref(), subject, state.verification_ttl, Utc::now()).await?;
    Ok(Json(issued))
}

/// GET /api/v1/verify-email?token=...
///
/// Always redirects to the status page; store failures show as `status=error`.
async fn verify_email(State(state): State<AppState>, Query(query): Query<VerifyQuery>) -> Redirect {
    let status = match consume(state.store.as_ref(), &query.token, Utc::now()).await {
        Ok(consumed) => consumed.status(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to consume verification token");
            "error"
        }
    };

    redirect_with(state.public_base_url(), STATUS_PAGE, &[("status", status)])
}
