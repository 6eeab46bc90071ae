//! Checkout form construction and gateway callback parsing.

use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::{DateTime, FixedOffset, Utc};
use pointdrop_checkmac::{sign, verify, CheckMacError, GatewayFields, MerchantKeys};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::models::{GatewayEcho, NewPaymentOrder};
use crate::store::{Ledger, OrderStore, Store, StoreError};

/// Gateway-local time is UTC+8.
const GATEWAY_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Prefix of every merchant trade number.
pub const TRADE_NO_PREFIX: &str = "PD";

/// Random characters appended to each trade number.
const TRADE_NO_SUFFIX_LEN: usize = 6;

/// The gateway rejects trade numbers longer than this.
pub const TRADE_NO_MAX_LEN: usize = 20;

/// Trade number collisions tolerated before checkout gives up.
const TRADE_NO_ATTEMPTS: usize = 3;

/// Gateway field limits.
const TRADE_DESC_MAX_LEN: usize = 200;
const ITEM_NAME_MAX_LEN: usize = 400;

/// Merchant settings needed to build and check gateway forms.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub merchant_id: String,
    pub keys: MerchantKeys,
    pub checkout_url: String,
    pub currency: String,
    pub public_base_url: String,
}

impl CheckoutSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            merchant_id: config.gateway.merchant_id.clone(),
            keys: config.gateway.keys(),
            checkout_url: config.gateway.checkout_url.clone(),
            currency: config.gateway.currency.clone(),
            public_base_url: config.public_base_url.clone(),
        }
    }

    fn callback_url(&self, path: &str) -> String {
        format!("{}/api/v1/payments/{}", self.public_base_url, path)
    }
}

/// Errors raised while starting a checkout.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid checkout request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A checkout to start for one account.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub account_id: String,
    /// Decimal amount in currency units, rounded half-up at this boundary.
    pub amount: String,
    pub points: i64,
    pub description: String,
    pub item_name: String,
    /// Where the customer's browser returns if they abandon the payment.
    pub return_url: Option<String>,
    pub custom_fields: Option<serde_json::Value>,
}

/// Signed form for a same-origin auto-submitting POST to the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutForm {
    pub trade_no: String,
    pub action: String,
    pub form: GatewayFields,
}

fn gateway_time(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS)
        .map(|tz| now.with_timezone(&tz))
        .unwrap_or_else(|| now.fixed_offset())
}

/// Generates a trade number: `PD`, `yyMMddHHmmss` in gateway time, six random alphanumerics.
pub fn generate_trade_no(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRADE_NO_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();

    format!(
        "{}{}{}",
        TRADE_NO_PREFIX,
        gateway_time(now).format("%y%m%d%H%M%S"),
        suffix
    )
}

/// Parses a decimal amount and rounds it half-up to whole currency units.
pub fn round_amount(amount: &str) -> Result<i64, CheckoutError> {
    let parsed = BigDecimal::from_str(amount.trim())
        .map_err(|e| CheckoutError::InvalidAmount(format!("{}: {}", amount, e)))?;

    let rounded = parsed
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
        .ok_or_else(|| CheckoutError::InvalidAmount(format!("{} is out of range", amount)))?;

    if rounded <= 0 {
        return Err(CheckoutError::InvalidAmount(format!(
            "{} rounds to {}, amount must be positive",
            amount, rounded
        )));
    }

    Ok(rounded)
}

/// Builds the signed gateway form for an order.
pub fn build_form(
    settings: &CheckoutSettings,
    order: &NewPaymentOrder,
    return_url: Option<&str>,
    now: DateTime<Utc>,
) -> GatewayFields {
    let client_back = return_url
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/recharge", settings.public_base_url));

    let mut fields = GatewayFields::new()
        .with("MerchantID", &settings.merchant_id)
        .with("MerchantTradeNo", &order.trade_no)
        .with(
            "MerchantTradeDate",
            gateway_time(now).format("%Y/%m/%d %H:%M:%S").to_string(),
        )
        .with("PaymentType", "aio")
        .with("TotalAmount", order.amount.to_string())
        .with("TradeDesc", &order.description)
        .with("ItemName", &order.item_name)
        .with("ReturnURL", settings.callback_url("notify"))
        .with("OrderResultURL", settings.callback_url("result"))
        .with("PaymentInfoURL", settings.callback_url("payment-info"))
        .with("ClientBackURL", client_back)
        .with("ChoosePayment", "ALL")
        .with("EncryptType", "1")
        .with("CustomField1", &order.account_id);

    sign(&mut fields, &settings.keys);
    fields
}

/// Creates a PENDING order and returns its signed checkout form.
pub async fn start_checkout<S: Store + ?Sized>(
    store: &S,
    settings: &CheckoutSettings,
    request: CheckoutRequest,
    now: DateTime<Utc>,
) -> Result<CheckoutForm, CheckoutError> {
    let amount = round_amount(&request.amount)?;
    if request.points <= 0 {
        return Err(CheckoutError::InvalidRequest("points must be positive".to_string()));
    }
    if request.description.trim().is_empty() || request.description.len() > TRADE_DESC_MAX_LEN {
        return Err(CheckoutError::InvalidRequest(format!(
            "description must be 1-{} bytes",
            TRADE_DESC_MAX_LEN
        )));
    }
    if request.item_name.trim().is_empty() || request.item_name.len() > ITEM_NAME_MAX_LEN {
        return Err(CheckoutError::InvalidRequest(format!(
            "itemName must be 1-{} bytes",
            ITEM_NAME_MAX_LEN
        )));
    }

    if store.account(&request.account_id).await?.is_none() {
        return Err(StoreError::AccountNotFound(request.account_id).into());
    }

    let mut attempt = 0;
    let order = loop {
        attempt += 1;
        let new_order = NewPaymentOrder {
            trade_no: generate_trade_no(now),
            account_id: request.account_id.clone(),
            points: request.points,
            amount,
            currency: settings.currency.clone(),
            description: request.description.clone(),
            item_name: request.item_name.clone(),
            custom_fields: request.custom_fields.clone().unwrap_or_else(|| json!({})),
        };

        match store.create_order(new_order.clone()).await {
            Ok(_) => break new_order,
            Err(StoreError::DuplicateTradeNo(trade_no)) if attempt < TRADE_NO_ATTEMPTS => {
                warn!(trade_no = %trade_no, attempt, "Trade number collision, regenerating");
            }
            Err(e) => return Err(e.into()),
        }
    };

    info!(
        trade_no = %order.trade_no,
        account_id = %order.account_id,
        points = order.points,
        amount = order.amount,
        "Checkout started"
    );

    let form = build_form(settings, &order, request.return_url.as_deref(), now);
    Ok(CheckoutForm {
        trade_no: order.trade_no,
        action: settings.checkout_url.clone(),
        form,
    })
}

/// Verifies an inbound gateway form. Mismatches are logged as security events.
pub fn authenticate(fields: &GatewayFields, keys: &MerchantKeys) -> Result<(), CheckMacError> {
    verify(fields, keys).map_err(|e| {
        warn!(
            target: "pointdrop_server::security",
            trade_no = fields.get("MerchantTradeNo").unwrap_or(""),
            error = %e,
            "Rejected gateway payload with bad CheckMacValue"
        );
        e
    })
}

/// Errors raised while reading a verified gateway payload.
#[derive(Debug, thiserror::Error)]
pub enum NoticeError {
    #[error("missing field {0}")]
    MissingField(&'static str),
}

/// Payment outcome reported by the gateway for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentNotice {
    pub trade_no: String,
    /// True when the gateway reports the payment as completed.
    pub succeeded: bool,
    pub rtn_code: String,
    pub rtn_msg: String,
    pub echo: GatewayEcho,
}

impl PaymentNotice {
    /// Reads a notify or order-result callback. `RtnCode` 1 means paid.
    pub fn from_callback(fields: &GatewayFields) -> Result<Self, NoticeError> {
        let trade_no = fields
            .get_non_empty("MerchantTradeNo")
            .ok_or(NoticeError::MissingField("MerchantTradeNo"))?;
        let rtn_code = fields
            .get_non_empty("RtnCode")
            .ok_or(NoticeError::MissingField("RtnCode"))?;

        Ok(Self {
            trade_no: trade_no.to_string(),
            succeeded: rtn_code.trim() == "1",
            rtn_code: rtn_code.to_string(),
            rtn_msg: fields.get("RtnMsg").unwrap_or_default().to_string(),
            echo: GatewayEcho::from_fields(fields),
        })
    }

    /// Reads a trade query result. Returns `None` unless `TradeStatus` is 1 (paid).
    pub fn from_trade_query(fields: &GatewayFields) -> Result<Option<Self>, NoticeError> {
        let trade_no = fields
            .get_non_empty("MerchantTradeNo")
            .ok_or(NoticeError::MissingField("MerchantTradeNo"))?;
        let status = fields
            .get_non_empty("TradeStatus")
            .ok_or(NoticeError::MissingField("TradeStatus"))?;

        if status.trim() != "1" {
            return Ok(None);
        }

        Ok(Some(Self {
            trade_no: trade_no.to_string(),
            succeeded: true,
            rtn_code: "1".to_string(),
            rtn_msg: "TradeStatus 1".to_string(),
            echo: GatewayEcho::from_fields(fields),
        }))
    }

    /// Amount the gateway says it collected.
    pub fn trade_amount(&self) -> Option<i64> {
        self.echo.trade_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use pointdrop_checkmac::CHECK_MAC_FIELD;

    fn settings() -> CheckoutSettings {
        CheckoutSettings::from_config(&AppConfig::default())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 4, 30, 45).unwrap()
    }

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            account_id: "acct_1".to_string(),
            amount: "500".to_string(),
            points: 1000,
            description: "Points top-up".to_string(),
            item_name: "Points x1000".to_string(),
            return_url: None,
            custom_fields: None,
        }
    }

    #[test]
    fn test_trade_no_shape() {
        let trade_no = generate_trade_no(fixed_now());
        assert_eq!(trade_no.len(), TRADE_NO_MAX_LEN);
        assert!(trade_no.starts_with("PD261016123045"));
        assert!(trade_no[14..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_round_amount_half_up() {
        assert_eq!(round_amount("500").unwrap(), 500);
        assert_eq!(round_amount("99.5").unwrap(), 100);
        assert_eq!(round_amount("99.49").unwrap(), 99);
        assert_eq!(round_amount(" 2.50 ").unwrap(), 3);
    }

    #[test]
    fn test_round_amount_rejects_bad_input() {
        assert!(matches!(round_amount("abc"), Err(CheckoutError::InvalidAmount(_))));
        assert!(matches!(round_amount("0.4"), Err(CheckoutError::InvalidAmount(_))));
        assert!(matches!(round_amount("-10"), Err(CheckoutError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_start_checkout_creates_pending_order() {
        let store = MemoryStore::new();
        store.open_account("acct_1").await.unwrap();

        let form = start_checkout(&store, &settings(), request(), fixed_now())
            .await
            .unwrap();

        assert_eq!(form.action, settings().checkout_url);
        assert_eq!(form.form.get("MerchantTradeNo"), Some(form.trade_no.as_str()));
        assert_eq!(form.form.get("MerchantTradeDate"), Some("2026/10/16 12:30:45"));
        assert_eq!(form.form.get("TotalAmount"), Some("500"));
        assert_eq!(form.form.get("CustomField1"), Some("acct_1"));
        assert_eq!(
            form.form.get("ReturnURL"),
            Some("http://localhost:8080/api/v1/payments/notify")
        );
        assert!(form.form.get(CHECK_MAC_FIELD).is_some());
        assert!(verify(&form.form, &settings().keys).is_ok());

        let order = store.get_order(&form.trade_no).await.unwrap().unwrap();
        assert!(order.is_pending());
        assert_eq!(order.points, 1000);
        assert_eq!(order.amount, 500);
        assert_eq!(order.currency, "TWD");
    }

    #[tokio::test]
    async fn test_start_checkout_unknown_account() {
        let store = MemoryStore::new();
        let err = start_checkout(&store, &settings(), request(), fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Store(StoreError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_checkout_rejects_non_positive_points() {
        let store = MemoryStore::new();
        store.open_account("acct_1").await.unwrap();
        let mut req = request();
        req.points = 0;
        let err = start_checkout(&store, &settings(), req, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidRequest(_)));
    }

    #[test]
    fn test_authenticate_rejects_tampered_amount() {
        let keys = settings().keys;
        let mut fields = GatewayFields::new()
            .with("MerchantTradeNo", "PD261016123045ABCDEF")
            .with("RtnCode", "1")
            .with("TradeAmt", "500");
        sign(&mut fields, &keys);
        assert!(authenticate(&fields, &keys).is_ok());

        fields.insert("TradeAmt", "5");
        assert!(matches!(
            authenticate(&fields, &keys),
            Err(CheckMacError::Mismatch)
        ));
    }

    #[test]
    fn test_notice_from_callback() {
        let fields = GatewayFields::new()
            .with("MerchantTradeNo", "PD261016123045ABCDEF")
            .with("RtnCode", "1")
            .with("RtnMsg", "Succeeded")
            .with("TradeAmt", "500")
            .with("TradeNo", "2610161230451234")
            .with("PaymentType", "Credit_CreditCard");

        let notice = PaymentNotice::from_callback(&fields).unwrap();
        assert!(notice.succeeded);
        assert_eq!(notice.trade_amount(), Some(500));
        assert_eq!(notice.echo.gateway_trade_no.as_deref(), Some("2610161230451234"));

        let failed = PaymentNotice::from_callback(&fields.clone().with("RtnCode", "10100058")).unwrap();
        assert!(!failed.succeeded);
    }

    #[test]
    fn test_notice_requires_trade_no() {
        let fields = GatewayFields::new().with("RtnCode", "1");
        assert!(matches!(
            PaymentNotice::from_callback(&fields),
            Err(NoticeError::MissingField("MerchantTradeNo"))
        ));
    }

    #[test]
    fn test_notice_from_trade_query() {
        let unpaid = GatewayFields::new()
            .with("MerchantTradeNo", "PD1")
            .with("TradeStatus", "0");
        assert_eq!(PaymentNotice::from_trade_query(&unpaid).unwrap(), None);

        let paid = unpaid.clone().with("TradeStatus", "1").with("TradeAmt", "500");
        let notice = PaymentNotice::from_trade_query(&paid).unwrap().unwrap();
        assert!(notice.succeeded);
        assert_eq!(notice.trade_amount(), Some(500));
    }
}
