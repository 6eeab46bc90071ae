//! API routes for the pointdrop server.

pub mod accounts;
pub mod billing;
pub mod payments;
pub mod verification;

use std::sync::Arc;

use axum::response::Redirect;
use axum::Router;

use crate::config::AppConfig;
use crate::gateway::TradeQuery;
use crate::payments::CheckoutSettings;
use crate::reconcile::{ReconcileQueue, RetryPolicy};
use crate::store::Store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<ReconcileQueue<dyn Store>>,
    pub gateway: Arc<dyn TradeQuery>,
    pub checkout: Arc<CheckoutSettings>,
    pub verification_ttl: chrono::Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn TradeQuery>, config: &AppConfig) -> Self {
        let queue = Arc::new(ReconcileQueue::new(
            store.clone(),
            RetryPolicy::from_config(&config.reconcile),
        ));

        Self {
            store,
            queue,
            gateway,
            checkout: Arc::new(CheckoutSettings::from_config(config)),
            verification_ttl: chrono::Duration::minutes(config.verification.ttl_minutes),
        }
    }

    /// Origin used for browser redirects.
    pub fn public_base_url(&self) -> &str {
        &self.checkout.public_base_url
    }
}

/// Creates the main API router with all routes mounted.
pub fn create_router(state: AppState) -> Router {
    Router::new().nest("/api/v1", api_v1_routes(state))
}

/// Creates the v1 API routes.
fn api_v1_routes(state: AppState) -> Router {
    Router::new()
        .nest("/billing", billing::router(state.clone()))
        .nest("/payments", payments::router(state.clone()))
        .merge(payments::admin_router(state.clone()))
        .merge(accounts::router(state.clone()))
        .merge(verification::router(state))
}

/// Redirects the browser to `{base}{path}?{query}`.
pub(crate) fn redirect_with(base: &str, path: &str, params: &[(&str, &str)]) -> Redirect {
    let query = serde_urlencoded::to_string(params).unwrap_or_default();
    Redirect::to(&format!("{}{}?{}", base, path, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::LOCATION;
    use axum::response::IntoResponse;

    #[test]
    fn test_redirect_with_encodes_query() {
        let response = redirect_with(
            "https://pointdrop.example",
            "/recharge/result",
            &[("tradeNo", "PD1 2"), ("status", "paid")],
        )
        .into_response();

        assert_eq!(response.status(), axum::http::StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[LOCATION],
            "https://pointdrop.example/recharge/result?tradeNo=PD1+2&status=paid"
        );
    }
}
