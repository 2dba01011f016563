use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Payment gateway credentials and endpoints.
#[derive(Clone, Debug, Deserialize, Validate, Default)]
pub struct GatewayConfig {
    /// PhonePe merchant id
    #[serde(default)]
    pub phonepe_merchant_id: String,
    /// PhonePe checksum salt key
    #[serde(default)]
    pub phonepe_salt_key: String,
    /// PhonePe salt key index (appended to the X-VERIFY checksum)
    #[serde(default = "default_salt_index")]
    pub phonepe_salt_index: u8,
    #[serde(default = "default_phonepe_base_url")]
    pub phonepe_base_url: String,

    /// Razorpay API key id
    #[serde(default)]
    pub razorpay_key_id: String,
    /// Razorpay API key secret
    #[serde(default)]
    pub razorpay_key_secret: String,
    /// Razorpay webhook signing secret
    #[serde(default)]
    pub razorpay_webhook_secret: String,
    #[serde(default = "default_razorpay_base_url")]
    pub razorpay_base_url: String,
}

impl GatewayConfig {
    /// Dummy credentials for tests; never points at a live endpoint.
    pub fn for_tests() -> Self {
        Self {
            phonepe_merchant_id: "M_TEST".to_string(),
            phonepe_salt_key: "test-salt-key".to_string(),
            phonepe_salt_index: 1,
            phonepe_base_url: "http://127.0.0.1:0".to_string(),
            razorpay_key_id: "rzp_test_key".to_string(),
            razorpay_key_secret: "rzp_test_secret".to_string(),
            razorpay_webhook_secret: "rzp_test_webhook_secret".to_string(),
            razorpay_base_url: "http://127.0.0.1:0".to_string(),
        }
    }
}

fn default_salt_index() -> u8 {
    1
}

fn default_phonepe_base_url() -> String {
    "https://api.phonepe.com/apis/hermes".to_string()
}

fn default_razorpay_base_url() -> String {
    "https://api.razorpay.com/v1".to_string()
}

/// Resilience tuning for outbound payment-gateway calls.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct ResilienceConfig {
    /// Failures before a provider breaker opens
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// Successes in half-open before the breaker closes again
    #[serde(default = "default_success_threshold")]
    pub breaker_success_threshold: u32,
    /// Hard per-call timeout, seconds
    #[serde(default = "default_call_timeout_secs")]
    pub breaker_call_timeout_secs: u64,
    /// Cool-down before an open breaker lets a probe through, seconds
    #[serde(default = "default_reset_timeout_secs")]
    pub breaker_reset_timeout_secs: u64,
    /// Retry attempts for transient gateway failures
    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    /// Base retry delay, milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling, milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: default_failure_threshold(),
            breaker_success_threshold: default_success_threshold(),
            breaker_call_timeout_secs: default_call_timeout_secs(),
            breaker_reset_timeout_secs: default_reset_timeout_secs(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    30000
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment (development, test, production)
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Minutes of inactivity before an Active cart is swept to Abandoned
    #[serde(default = "default_cart_expiry_minutes")]
    pub cart_expiry_minutes: i64,

    /// Seconds between stale-cart sweep runs (0 disables the sweeper)
    #[serde(default = "default_cart_sweep_interval_secs")]
    pub cart_sweep_interval_secs: u64,

    /// Default currency for carts that do not specify one
    #[serde(default = "default_currency")]
    pub default_currency: String,

    #[serde(default)]
    #[validate]
    pub gateways: GatewayConfig,

    #[serde(default)]
    #[validate]
    pub resilience: ResilienceConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_cart_expiry_minutes() -> i64 {
    60 * 24 * 7
}
fn default_cart_sweep_interval_secs() -> u64 {
    300
}
fn default_currency() -> String {
    "INR".to_string()
}

impl AppConfig {
    /// Minimal constructor used by tests.
    pub fn for_tests(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: 1,
            db_min_connections: 1,
            cart_expiry_minutes: default_cart_expiry_minutes(),
            cart_sweep_interval_secs: 0,
            default_currency: default_currency(),
            gateways: GatewayConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads configuration from `config/default`, `config/<env>`, and
/// `APP__`-prefixed environment variables, in increasing precedence.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
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
        .set_default("database_url", "sqlite://bookshop.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;

    Ok(app_config)
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("bookshop_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resilience_defaults_match_documented_values() {
        let r = ResilienceConfig::default();
        assert_eq!(r.breaker_failure_threshold, 5);
        assert_eq!(r.breaker_success_threshold, 2);
        assert_eq!(r.breaker_call_timeout_secs, 60);
        assert_eq!(r.breaker_reset_timeout_secs, 30);
        assert_eq!(r.retry_max_attempts, 3);
        assert_eq!(r.retry_base_delay_ms, 1000);
        assert_eq!(r.retry_max_delay_ms, 30000);
    }

    #[test]
    fn test_config_validates() {
        let cfg = AppConfig::for_tests("sqlite::memory:");
        assert!(cfg.validate().is_ok());
        assert!(!cfg.is_production());
        assert_eq!(cfg.default_currency, "INR");
    }
}
