pub mod cache;
pub mod pricing;

pub use cache::ResponseCache;
pub use pricing::PricingEngine;
