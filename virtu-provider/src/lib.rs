pub mod catalog;
pub mod mock;
pub mod registry;

pub use catalog::{CatalogResponse, CatalogService};
pub use mock::MockProvider;
pub use registry::{ProviderRegistry, SelectedQuote, SelectionStrategy};
