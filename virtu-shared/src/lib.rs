pub mod models;
pub mod money;
pub mod settings;

pub use models::kind::ProductKind;
pub use settings::{CommissionSettings, PlatformSettings, PricingPolicy};
