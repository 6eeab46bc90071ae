//! Payment order model: one gateway transaction from checkout to settlement.

use chrono::{DateTime, Utc};
use pointdrop_checkmac::{GatewayFields, CHECK_MAC_FIELD};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Possible states of a payment order. PENDING is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Checkout form built, payment not confirmed.
    Pending,
    /// Payment confirmed and points credited.
    Paid,
    /// Gateway reported failure, or the account no longer exists.
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
        }
    }
}

/// Represents a payment order keyed by the merchant trade number.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    /// Merchant trade number (globally unique, caller generated).
    pub trade_no: String,
    /// Account to credit once paid.
    pub account_id: String,
    /// Points to credit.
    pub points: i64,
    /// Amount charged, in whole currency units.
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub item_name: String,
    /// Extra merchant fields echoed back by the gateway.
    pub custom_fields: serde_json::Value,
    pub status: OrderStatus,
    /// Gateway payment method, e.g. `Credit_CreditCard`.
    pub payment_type: Option<String>,
    /// Gateway-side transaction number.
    pub gateway_trade_no: Option<String>,
    /// Amount the gateway reports as paid.
    pub trade_amount: Option<i64>,
    /// Payment date as reported by the gateway.
    pub payment_date: Option<String>,
    /// Ledger entry holding the credit (set once paid).
    pub ledger_id: Option<Uuid>,
    /// Account balance right after the credit (set once paid).
    pub balance_after: Option<i64>,
    /// Raw payment-instruction callback, for audit.
    pub payment_info: Option<serde_json::Value>,
    /// Raw terminal notification, for audit.
    pub notify_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data required to create a new payment order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPaymentOrder {
    pub trade_no: String,
    pub account_id: String,
    pub points: i64,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub item_name: String,
    pub custom_fields: serde_json::Value,
}

impl NewPaymentOrder {
    /// Materialises the order in its initial PENDING state.
    pub fn into_pending(self) -> PaymentOrder {
        let now = Utc::now();
        PaymentOrder {
            trade_no: self.trade_no,
            account_id: self.account_id,
            points: self.points,
            amount: self.amount,
            currency: self.currency,
            description: self.description,
            item_name: self.item_name,
            custom_fields: self.custom_fields,
            status: OrderStatus::Pending,
            payment_type: None,
            gateway_trade_no: None,
            trade_amount: None,
            payment_date: None,
            ledger_id: None,
            balance_after: None,
            payment_info: None,
            notify_payload: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Gateway fields echoed on callbacks. Absent values never overwrite stored ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayEcho {
    pub payment_type: Option<String>,
    pub gateway_trade_no: Option<String>,
    pub trade_amount: Option<i64>,
    pub payment_date: Option<String>,
    /// The callback form without its signature.
    pub payload: serde_json::Value,
}

impl GatewayEcho {
    pub fn from_fields(fields: &GatewayFields) -> Self {
        let payload = fields
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(CHECK_MAC_FIELD))
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect::<serde_json::Map<_, _>>();

        Self {
            payment_type: fields.get_non_empty("PaymentType").map(str::to_string),
            gateway_trade_no: fields.get_non_empty("TradeNo").map(str::to_string),
            trade_amount: fields
                .get_non_empty("TradeAmt")
                .and_then(|v| v.trim().parse().ok()),
            payment_date: fields.get_non_empty("PaymentDate").map(str::to_string),
            payload: serde_json::Value::Object(payload),
        }
    }
}

impl PaymentOrder {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn is_paid(&self) -> bool {
        self.status == OrderStatus::Paid
    }

    pub fn is_failed(&self) -> bool {
        self.status == OrderStatus::Failed
    }

    /// Merges echoed gateway fields, keeping stored values where the echo has none.
    pub fn merge_echo(&mut self, echo: &GatewayEcho) {
        if echo.payment_type.is_some() {
            self.payment_type = echo.payment_type.clone();
        }
        if echo.gateway_trade_no.is_some() {
            self.gateway_trade_no = echo.gateway_trade_no.clone();
        }
        if echo.trade_amount.is_some() {
            self.trade_amount = echo.trade_amount;
        }
        if echo.payment_date.is_some() {
            self.payment_date = echo.payment_date.clone();
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_order() -> PaymentOrder {
        NewPaymentOrder {
            trade_no: "PD261016123045ABCDEF".to_string(),
            account_id: "acct_1".to_string(),
            points: 1000,
            amount: 500,
            currency: "TWD".to_string(),
            description: "Points top-up".to_string(),
            item_name: "Points x1000".to_string(),
            custom_fields: json!({}),
        }
        .into_pending()
    }

    #[test]
    fn test_order_status_serialization() {
        assert_eq!(serde_json::to_string(&OrderStatus::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(serde_json::to_string(&OrderStatus::Paid).unwrap(), "\"PAID\"");
        assert_eq!(
            serde_json::from_str::<OrderStatus>("\"FAILED\"").unwrap(),
            OrderStatus::Failed
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_order_is_pending() {
        let order = pending_order();
        assert!(order.is_pending());
        assert!(!order.is_paid());
        assert!(!order.is_failed());
        assert!(order.ledger_id.is_none());
        assert!(order.balance_after.is_none());
    }

    #[test]
    fn test_echo_from_fields() {
        let fields = GatewayFields::new()
            .with("PaymentType", "ATM_LAND")
            .with("TradeNo", "2610161230451234")
            .with("TradeAmt", "500")
            .with("PaymentDate", "")
            .with("CheckMacValue", "ABC");
        let echo = GatewayEcho::from_fields(&fields);
        assert_eq!(echo.payment_type.as_deref(), Some("ATM_LAND"));
        assert_eq!(echo.gateway_trade_no.as_deref(), Some("2610161230451234"));
        assert_eq!(echo.trade_amount, Some(500));
        assert_eq!(echo.payment_date, None);
        assert!(echo.payload.get("CheckMacValue").is_none());
        assert_eq!(echo.payload["TradeAmt"], "500");
    }

    #[test]
    fn test_merge_echo_keeps_existing_values() {
        let mut order = pending_order();
        order.merge_echo(&GatewayEcho {
            payment_type: Some("ATM_LAND".into()),
            gateway_trade_no: Some("G1".into()),
            ..Default::default()
        });
        order.merge_echo(&GatewayEcho {
            trade_amount: Some(500),
            payment_date: Some("2026/10/16 12:31:02".into()),
            ..Default::default()
        });
        assert_eq!(order.payment_type.as_deref(), Some("ATM_LAND"));
        assert_eq!(order.gateway_trade_no.as_deref(), Some("G1"));
        assert_eq!(order.trade_amount, Some(500));
        assert_eq!(order.payment_date.as_deref(), Some("2026/10/16 12:31:02"));
    }
}
