pub mod deposits;
pub mod service;

pub use deposits::DepositService;
pub use service::Ledger;
