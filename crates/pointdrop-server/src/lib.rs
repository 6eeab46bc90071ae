//! Pointdrop Server - points ledger API
//!
//! This crate provides the REST API for pointdrop's prepaid points: download
//! billing, gateway checkout with callback reconciliation, and email
//! verification tokens.

pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod payments;
pub mod reconcile;
pub mod routes;
pub mod store;
pub mod sweeper;
pub mod verification;

pub use error::AppError;
pub use routes::{create_router, AppState};
