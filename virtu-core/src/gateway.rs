use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInit {
    pub redirect_url: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub success: bool,
    pub amount: Decimal,
    pub status: String,
    pub gateway_reference: String,
    pub reference: String,
}

/// Deposit gateway, distinct from fulfillment providers. Consumers must
/// cross-check reference and amount against the stored pending transaction
/// before crediting, and must stay idempotent under re-verification.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize_payment(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> CoreResult<PaymentInit>;

    async fn verify_payment(&self, reference: &str) -> CoreResult<PaymentVerification>;
}

/// In-memory gateway used by tests and local runs.
pub struct MockPaymentGateway {
    initialized: Mutex<HashMap<String, Decimal>>,
    /// Overrides what `verify_payment` reports, to simulate tampering.
    amount_overrides: Mutex<HashMap<String, Decimal>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self {
            initialized: Mutex::new(HashMap::new()),
            amount_overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn override_amount(&self, reference: &str, amount: Decimal) {
        self.amount_overrides
            .lock()
            .unwrap()
            .insert(reference.to_string(), amount);
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn initialize_payment(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> CoreResult<PaymentInit> {
        let reference = format!("mock_gw_{}", Uuid::new_v4().simple());
        self.initialized
            .lock()
            .unwrap()
            .insert(reference.clone(), amount);
        Ok(PaymentInit {
            redirect_url: format!("https://gateway.example/pay/{}/{}", account_id, reference),
            reference,
        })
    }

    async fn verify_payment(&self, reference: &str) -> CoreResult<PaymentVerification> {
        let initialized = self.initialized.lock().unwrap();
        let amount = initialized
            .get(reference)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("gateway reference {}", reference)))?;
        let amount = self
            .amount_overrides
            .lock()
            .unwrap()
            .get(reference)
            .copied()
            .unwrap_or(amount);
        Ok(PaymentVerification {
            success: true,
            amount,
            status: "success".to_string(),
            gateway_reference: format!("gw_{}", reference),
            reference: reference.to_string(),
        })
    }
}
