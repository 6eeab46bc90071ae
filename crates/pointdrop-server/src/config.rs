//! Server configuration.
//!
//! Loaded from, in order of precedence (lowest first):
//! 1. Built-in defaults (gateway staging merchant, local listen address)
//! 2. A YAML file named by `POINTDROP_CONFIG`, if set
//! 3. Environment variables prefixed `POINTDROP__`, e.g. `POINTDROP__GATEWAY__HASH_KEY`

use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use pointdrop_checkmac::MerchantKeys;
use serde::Deserialize;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_ENV_VAR: &str = "POINTDROP_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "POINTDROP";
/// Environment variable for logging filters.
pub const LOG_ENV_VAR: &str = "POINTDROP_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Postgres connection string. Without one the server runs on the in-memory store.
    pub database_url: Option<String>,
    pub listen_addr: String,
    /// Externally reachable origin, used for gateway callbacks and redirects.
    pub public_base_url: String,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub reconcile: ReconcileConfig,
    pub verification: VerificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            listen_addr: "0.0.0.0:8080".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            reconcile: ReconcileConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Server-side `statement_timeout` for every pooled connection.
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 5,
            statement_timeout_secs: 5,
        }
    }
}

/// Payment gateway merchant settings. Defaults point at the public staging merchant.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub merchant_id: String,
    pub hash_key: String,
    pub hash_iv: String,
    pub checkout_url: String,
    pub query_url: String,
    pub currency: String,
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn keys(&self) -> MerchantKeys {
        MerchantKeys::new(&self.hash_key, &self.hash_iv)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            merchant_id: "3002607".to_string(),
            hash_key: "pwFHCqoQZGmho4w6".to_string(),
            hash_iv: "EkRm7iFT261dpevs".to_string(),
            checkout_url: "https://payment-stage.ecpay.com.tw/Cashier/AioCheckOut/V5".to_string(),
            query_url: "https://payment-stage.ecpay.com.tw/Cashier/QueryTradeInfo/V5".to_string(),
            currency: "TWD".to_string(),
            timeout_secs: 5,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("merchant_id", &self.merchant_id)
            .field("hash_key", &"<redacted>")
            .field("hash_iv", &"<redacted>")
            .field("checkout_url", &self.checkout_url)
            .field("query_url", &self.query_url)
            .field("currency", &self.currency)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Reconciliation retry and sweep settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub base_delay_ms: u64,
    pub factor: f32,
    pub max_delay_ms: u64,
    /// Total attempts per notification, including the first.
    pub max_attempts: usize,
    /// Seconds between sweeps of stale pending orders. Zero disables the sweeper.
    pub sweep_interval_secs: u64,
    /// Pending orders younger than this are left to the gateway callbacks.
    pub sweep_min_age_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 5000,
            max_attempts: 6,
            sweep_interval_secs: 60,
            sweep_min_age_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub ttl_minutes: i64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { ttl_minutes: 30 }
    }
}

impl AppConfig {
    /// Loads configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gateway = &self.gateway;
        if gateway.merchant_id.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.merchant_id is empty".to_string()));
        }
        if gateway.hash_key.is_empty() || gateway.hash_iv.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway.hash_key and gateway.hash_iv must be set".to_string(),
            ));
        }
        if self.database.statement_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "database.statement_timeout_secs must be positive".to_string(),
            ));
        }
        if gateway.timeout_secs == 0 {
            return Err(ConfigError::Invalid("gateway.timeout_secs must be positive".to_string()));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconcile.max_attempts must be at least 1".to_string()));
        }
        if self.reconcile.factor < 1.0 {
            return Err(ConfigError::Invalid("reconcile.factor must be at least 1.0".to_string()));
        }
        if self.verification.ttl_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "verification.ttl_minutes must be positive".to_string(),
            ));
        }
        if self.public_base_url.ends_with('/') {
            return Err(ConfigError::Invalid(
                "public_base_url must not end with '/'".to_string(),
            ));
        }
        Ok(())
    }
}
