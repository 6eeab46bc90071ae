//! CheckMacValue computation and verification.
//!
//! The gateway authenticates every form with a keyed digest:
//!
//! 1. drop the `CheckMacValue` field,
//! 2. order the remaining keys case-insensitively and join them as `key=value&...`,
//! 3. wrap as `HashKey=<key>&<joined>&HashIV=<iv>`,
//! 4. encode with [`gateway_url_encode`],
//! 5. SHA-256, uppercase hex.
//!
//! Verification recomputes the digest over the inbound fields and compares it
//! case-insensitively with the supplied value.

use serde::{Deserialize, Serialize};

use crate::encode::gateway_url_encode;
use crate::fields::GatewayFields;
use crate::hash::sha256_hex_upper;

/// Name of the signature field in gateway forms.
pub const CHECK_MAC_FIELD: &str = "CheckMacValue";

/// Shared secrets issued by the gateway to a merchant.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerchantKeys {
    pub hash_key: String,
    pub hash_iv: String,
}

impl MerchantKeys {
    pub fn new(hash_key: impl Into<String>, hash_iv: impl Into<String>) -> Self {
        Self {
            hash_key: hash_key.into(),
            hash_iv: hash_iv.into(),
        }
    }
}

impl std::fmt::Debug for MerchantKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerchantKeys")
            .field("hash_key", &"<redacted>")
            .field("hash_iv", &"<redacted>")
            .finish()
    }
}

/// Errors from CheckMacValue verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckMacError {
    #[error("missing CheckMacValue field")]
    Missing,

    #[error("CheckMacValue mismatch")]
    Mismatch,
}

/// Builds the pre-encoding signing string for `fields`.
pub fn signing_string(fields: &GatewayFields, keys: &MerchantKeys) -> String {
    let joined = fields
        .signing_order(CHECK_MAC_FIELD)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("HashKey={}&{}&HashIV={}", keys.hash_key, joined, keys.hash_iv)
}

/// Computes the CheckMacValue for `fields`, ignoring any existing signature field.
pub fn check_mac_value(fields: &GatewayFields, keys: &MerchantKeys) -> String {
    let encoded = gateway_url_encode(&signing_string(fields, keys));
    sha256_hex_upper(encoded.as_bytes())
}

/// Signs `fields` in place, replacing any existing CheckMacValue.
pub fn sign(fields: &mut GatewayFields, keys: &MerchantKeys) {
    let mac = check_mac_value(fields, keys);
    fields.insert(CHECK_MAC_FIELD, mac);
}

/// Verifies the CheckMacValue carried in `fields`.
pub fn verify(fields: &GatewayFields, keys: &MerchantKeys) -> Result<(), CheckMacError> {
    let supplied = fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(CHECK_MAC_FIELD))
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
        .ok_or(CheckMacError::Missing)?;

    let expected = check_mac_value(fields, keys);
    if expected.eq_ignore_ascii_case(supplied) {
        Ok(())
    } else {
        Err(CheckMacError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging_keys() -> MerchantKeys {
        MerchantKeys::new("pwFHCqoQZGmho4w6", "EkRm7iFT261dpevs")
    }

    fn sample_fields() -> GatewayFields {
        GatewayFields::new()
            .with("MerchantID", "3002607")
            .with("MerchantTradeNo", "PD261016123045ABCDEF")
            .with("TotalAmount", "500")
            .with("ItemName", "Points x1000")
    }

    #[test]
    fn test_signing_string_layout() {
        let fields = GatewayFields::new().with("b", "2").with("A", "1");
        assert_eq!(
            signing_string(&fields, &MerchantKeys::new("K", "V")),
            "HashKey=K&A=1&b=2&HashIV=V"
        );
    }

    #[test]
    fn test_check_mac_ignores_existing_signature() {
        let fields = sample_fields();
        let with_sig = fields.clone().with(CHECK_MAC_FIELD, "WHATEVER");
        assert_eq!(
            check_mac_value(&fields, &staging_keys()),
            check_mac_value(&with_sig, &staging_keys())
        );
    }

    #[test]
    fn test_sign_then_verify() {
        let mut fields = sample_fields();
        sign(&mut fields, &staging_keys());
        assert_eq!(fields.get(CHECK_MAC_FIELD).map(str::len), Some(64));
        assert_eq!(verify(&fields, &staging_keys()), Ok(()));
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let mut fields = sample_fields();
        let mac = check_mac_value(&fields, &staging_keys());
        fields.insert(CHECK_MAC_FIELD, mac.to_ascii_lowercase());
        assert_eq!(verify(&fields, &staging_keys()), Ok(()));
    }

    #[test]
    fn test_verify_rejects_tampered_amount() {
        let mut fields = sample_fields();
        sign(&mut fields, &staging_keys());
        fields.insert("TotalAmount", "5");
        assert_eq!(verify(&fields, &staging_keys()), Err(CheckMacError::Mismatch));
    }

    #[test]
    fn test_verify_rejects_wrong_keys() {
        let mut fields = sample_fields();
        sign(&mut fields, &staging_keys());
        let other = MerchantKeys::new("5294y06JbISpM5x9", "v77hoKGq4kWxNNIS");
        assert_eq!(verify(&fields, &other), Err(CheckMacError::Mismatch));
    }

    #[test]
    fn test_verify_requires_signature() {
        assert_eq!(
            verify(&sample_fields(), &staging_keys()),
            Err(CheckMacError::Missing)
        );
        let blank = sample_fields().with(CHECK_MAC_FIELD, "");
        assert_eq!(verify(&blank, &staging_keys()), Err(CheckMacError::Missing));
    }

    #[test]
    fn test_merchant_keys_debug_redacts() {
        let rendered = format!("{:?}", staging_keys());
        assert!(!rendered.contains("pwFHCqoQZGmho4w6"));
        assert!(rendered.contains("redacted"));
    }
}
