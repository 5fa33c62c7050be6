pub mod commission;
pub mod orchestrator;
pub mod reconcile;

pub use commission::CommissionTrigger;
pub use orchestrator::{FulfillmentOrchestrator, PurchaseRequest};
pub use reconcile::{ReconciliationSweep, SweepReport};
