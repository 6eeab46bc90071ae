//! Payment gateway trade query client.

use async_trait::async_trait;
use chrono::Utc;
use pointdrop_checkmac::{sign, verify, GatewayFields, MerchantKeys};
use tracing::{debug, warn};

use crate::config::GatewayConfig;

/// Errors talking to the payment gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected gateway response: {0}")]
    BadResponse(String),

    #[error("gateway response failed CheckMacValue verification")]
    Signature,
}

/// Looks up the gateway's view of a trade.
#[async_trait]
pub trait TradeQuery: Send + Sync {
    /// Returns the verified `QueryTradeInfo` fields for `trade_no`.
    async fn query_trade(&self, trade_no: &str) -> Result<GatewayFields, GatewayError>;
}

/// HTTP client for the gateway's trade query endpoint.
pub struct GatewayClient {
    http: reqwest::Client,
    merchant_id: String,
    keys: MerchantKeys,
    query_url: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            merchant_id: config.merchant_id.clone(),
            keys: config.keys(),
            query_url: config.query_url.clone(),
        })
    }

    /// Signed `QueryTradeInfo` request body.
    fn query_form(&self, trade_no: &str) -> GatewayFields {
        let mut fields = GatewayFields::new()
            .with("MerchantID", &self.merchant_id)
            .with("MerchantTradeNo", trade_no)
            .with("TimeStamp", Utc::now().timestamp().to_string());
        sign(&mut fields, &self.keys);
        fields
    }
}

/// Parses and verifies a form-encoded gateway response.
pub fn parse_response(body: &str, keys: &MerchantKeys) -> Result<GatewayFields, GatewayError> {
    let fields: GatewayFields = serde_urlencoded::from_str(body.trim())
        .map_err(|e| GatewayError::BadResponse(format!("malformed body: {}", e)))?;

    if fields.is_empty() {
        return Err(GatewayError::BadResponse("empty body".to_string()));
    }

    verify(&fields, keys).map_err(|e| {
        warn!(
            target: "pointdrop_server::security",
            trade_no = fields.get("MerchantTradeNo").unwrap_or(""),
            error = %e,
            "Gateway trade query response failed verification"
        );
        GatewayError::Signature
    })?;

    Ok(fields)
}

#[async_trait]
impl TradeQuery for GatewayClient {
    async fn query_trade(&self, trade_no: &str) -> Result<GatewayFields, GatewayError> {
        let response = self
            .http
            .post(&self.query_url)
            .form(&self.query_form(trade_no))
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(GatewayError::BadResponse(format!(
                "HTTP {} - {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        debug!(trade_no = %trade_no, "Gateway trade query answered");
        parse_response(&body, &self.keys)
    }
}
