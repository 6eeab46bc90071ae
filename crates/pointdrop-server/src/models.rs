//! Database models for pointdrop.

pub mod account;
pub mod download_charge;
pub mod ledger_entry;
pub mod payment_order;
pub mod verification_token;

pub use account::PointsAccount;
pub use download_charge::{minute_bucket, DedupKey, Platform};
pub use ledger_entry::{LedgerDelta, LedgerEntry, LedgerReason};
pub use payment_order::{GatewayEcho, NewPaymentOrder, OrderStatus, PaymentOrder};
pub use verification_token::{Consumed, IssuedToken, VerificationToken};
