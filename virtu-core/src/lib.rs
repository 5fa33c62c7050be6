pub mod account;
pub mod gateway;
pub mod order;
pub mod provider;
pub mod repository;

use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("Provider timed out: {0}")]
    ProviderTimeout(String),
    #[error("Inventory exhausted: {0}")]
    InventoryExhausted(String),
    #[error("Provider rejected the request: {0}")]
    ProviderRejected(String),
    #[error("Payment verification mismatch: {0}")]
    VerificationMismatch(String),
    #[error("Outcome unknown, queued for reconciliation: {0}")]
    ReconciliationRequired(String),
    #[error("Purchase limit reached: {0}")]
    PurchaseLimit(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable message safe to surface to a user. Storage/internal detail is
    /// logged upstream, never echoed.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::Storage(_) | CoreError::Internal(_) => {
                "Internal service error".to_string()
            }
            CoreError::ReconciliationRequired(_) => {
                "Your order is being processed".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the caller may safely retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderUnavailable(_) | CoreError::ProviderTimeout(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
