use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub catalog: CatalogConfig,
    pub sweep: SweepConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweepConfig {
    pub interval_seconds: u64,
    pub lock_ttl_seconds: u64,
}

/// File-level defaults for platform settings; the database rows in
/// `platform_settings` override these at runtime via `SettingsCache`.
#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    #[serde(default = "default_markup")]
    pub markup_percentage: i64,
    #[serde(default = "default_min_price")]
    pub min_price: i64,
    #[serde(default)]
    pub platform_fee: i64,
    pub exchange_rate: f64,
    pub max_open_orders: i64,
    pub commission_rate: f64,
    pub commission_max_purchases: i64,
    pub fulfillment_timeout_secs: u64,
    pub pending_grace_minutes: i64,
}

fn default_markup() -> i64 {
    200
}

fn default_min_price() -> i64 {
    500
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in.
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("VIRTU").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
