use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_FREE_SHIP_THRESHOLD: i64 = 500_000;
const DEFAULT_SHIPPING_FEE: i64 = 30_000;
const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 10;
const DEFAULT_STOCKTAKE_STORE_PATH: &str = "data/stocktake_sessions.json";
const DEFAULT_BULK_PREVIEW_TTL_SECS: u64 = 900;

/// Shipping fee rules applied by the cart pricing engine
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Total before shipping at or above which shipping is waived (whole currency units)
    #[serde(default = "default_free_ship_threshold")]
    #[validate(range(min = 1))]
    pub free_ship_threshold: i64,

    /// Flat shipping fee below the threshold (whole currency units)
    #[serde(default = "default_shipping_fee")]
    #[validate(range(min = 0))]
    pub shipping_fee: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            free_ship_threshold: default_free_ship_threshold(),
            shipping_fee: default_shipping_fee(),
        }
    }
}

/// Currency display settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CurrencyConfig {
    #[serde(default = "default_currency_code")]
    #[validate(length(equal = 3))]
    pub code: String,

    #[serde(default = "default_currency_symbol")]
    pub symbol: String,

    /// Thousands separator, e.g. "." for vi-VN or "," for en-US
    #[serde(default = "default_group_separator")]
    #[validate(length(min = 1, max = 4))]
    pub group_separator: String,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            code: default_currency_code(),
            symbol: default_currency_symbol(),
            group_separator: default_group_separator(),
        }
    }
}

/// What to do when a request names no variant and nothing matches by color
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantFallbackPolicy {
    /// Use the product's first variant and log the decision
    #[default]
    FirstVariant,
    /// Fail with NOT_FOUND
    Reject,
}

/// Where stocktake sessions are persisted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StocktakeStoreKind {
    #[default]
    File,
    Database,
}

/// Inventory ledger and stocktake settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct InventoryConfig {
    /// Variants at or below this on-hand quantity are in the `low` stocktake scope
    #[serde(default = "default_low_stock_threshold")]
    #[validate(range(min = 0))]
    pub low_stock_threshold: i32,

    #[serde(default)]
    pub variant_fallback: VariantFallbackPolicy,

    #[serde(default)]
    pub stocktake_store: StocktakeStoreKind,

    /// JSON file used when `stocktake_store = "file"`
    #[serde(default = "default_stocktake_store_path")]
    pub stocktake_store_path: PathBuf,

    /// Lifetime of an uploaded bulk adjustment preview
    #[serde(default = "default_bulk_preview_ttl_secs")]
    #[validate(range(min = 1))]
    pub bulk_preview_ttl_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: default_low_stock_threshold(),
            variant_fallback: VariantFallbackPolicy::default(),
            stocktake_store: StocktakeStoreKind::default(),
            stocktake_store_path: default_stocktake_store_path(),
            bulk_preview_ttl_secs: default_bulk_preview_ttl_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub currency: CurrencyConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,
}

impl AppConfig {
    /// Creates a configuration with every optional setting at its default
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            pricing: PricingConfig::default(),
            currency: CurrencyConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Validates the top level and every nested section
    pub fn validate_all(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        self.pricing.validate()?;
        self.currency.validate()?;
        self.inventory.validate()?;

        if self.db_min_connections > self.db_max_connections {
            let mut errors = validator::ValidationErrors::new();
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
            return Err(errors);
        }

        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_free_ship_threshold() -> i64 {
    DEFAULT_FREE_SHIP_THRESHOLD
}

fn default_shipping_fee() -> i64 {
    DEFAULT_SHIPPING_FEE
}

fn default_currency_code() -> String {
    "VND".to_string()
}

fn default_currency_symbol() -> String {
    "₫".to_string()
}

fn default_group_separator() -> String {
    ".".to_string()
}

fn default_low_stock_threshold() -> i32 {
    DEFAULT_LOW_STOCK_THRESHOLD
}

fn default_stocktake_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STOCKTAKE_STORE_PATH)
}

fn default_bulk_preview_ttl_secs() -> u64 {
    DEFAULT_BULK_PREVIEW_TTL_SECS
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_engine={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    let result = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        // A subscriber installed by the host application wins.
        tracing::debug!("Tracing subscriber already initialized: {}", e);
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "test".into())
    }

    #[test]
    fn defaults_match_storefront_rules() {
        let cfg = base_config();
        assert_eq!(cfg.pricing.free_ship_threshold, 500_000);
        assert_eq!(cfg.pricing.shipping_fee, 30_000);
        assert_eq!(cfg.inventory.low_stock_threshold, 10);
        assert_eq!(
            cfg.inventory.variant_fallback,
            VariantFallbackPolicy::FirstVariant
        );
        assert_eq!(cfg.inventory.stocktake_store, StocktakeStoreKind::File);
        assert!(cfg.validate_all().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = base_config();
        cfg.log_level = "verbose".into();
        assert!(cfg.validate_all().is_err());
    }

    #[test]
    fn rejects_min_connections_above_max() {
        let mut cfg = base_config();
        cfg.db_min_connections = 20;
        cfg.db_max_connections = 4;
        assert!(cfg.validate_all().is_err());
    }

    #[test]
    fn rejects_zero_free_ship_threshold() {
        let mut cfg = base_config();
        cfg.pricing.free_ship_threshold = 0;
        assert!(cfg.validate_all().is_err());
    }

    #[test]
    fn nested_sections_deserialize_from_toml() {
        let raw = r#"
            database_url = "postgres://localhost/shop"
            environment = "production"

            [pricing]
            free_ship_threshold = 300000

            [inventory]
            variant_fallback = "reject"
            stocktake_store = "database"
        "#;

        let cfg: AppConfig = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .expect("config should deserialize");

        assert!(cfg.is_production());
        assert_eq!(cfg.pricing.free_ship_threshold, 300_000);
        assert_eq!(cfg.pricing.shipping_fee, 30_000);
        assert_eq!(cfg.inventory.variant_fallback, VariantFallbackPolicy::Reject);
        assert_eq!(cfg.inventory.stocktake_store, StocktakeStoreKind::Database);
        assert_eq!(cfg.currency.code, "VND");
    }
}
