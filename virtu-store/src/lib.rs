pub mod app_config;
pub mod database;
pub mod events;
pub mod ledger_repo;
pub mod memory;
pub mod order_repo;
pub mod redis_repo;
pub mod referral_repo;
pub mod settings;

pub use database::DbClient;
pub use events::EventProducer;
pub use redis_repo::RedisClient;
pub use settings::SettingsCache;
