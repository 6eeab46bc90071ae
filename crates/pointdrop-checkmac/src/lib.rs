// pointdrop CheckMac - request/response signing for the payment gateway

pub mod checkmac;
pub mod encode;
pub mod fields;
pub mod hash;

pub use checkmac::{check_mac_value, sign, verify, CheckMacError, MerchantKeys, CHECK_MAC_FIELD};
pub use encode::gateway_url_encode;
pub use fields::GatewayFields;
pub use hash::{sha256_hex, sha256_hex_upper};
