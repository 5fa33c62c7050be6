use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use virtu_core::account::{Direction, NewTransaction, Transaction, TransactionStatus};
use virtu_core::gateway::PaymentGateway;
use virtu_core::repository::LedgerRepository;
use virtu_core::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DepositReceipt {
    pub transaction: Transaction,
    pub redirect_url: String,
}

/// Gateway-funded wallet deposits, distinct from fulfillment.
///
/// The pending credit row is written before the user is redirected; the
/// gateway reference doubles as the transaction reference so the callback can
/// be matched idempotently.
pub struct DepositService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn LedgerRepository>,
}

impl DepositService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn LedgerRepository>) -> Self {
        Self { gateway, store }
    }

    pub async fn initialize(&self, account_id: Uuid, amount: Decimal) -> CoreResult<DepositReceipt> {
        if amount <= Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "deposit amount must be positive, got {}",
                amount
            )));
        }

        let init = self.gateway.initialize_payment(account_id, amount).await?;
        let transaction = self
            .store
            .insert_pending(
                account_id,
                NewTransaction::new(Direction::Credit, amount, "gateway", "Wallet deposit")
                    .with_reference(&init.reference),
            )
            .await?;

        Ok(DepositReceipt {
            transaction,
            redirect_url: init.redirect_url,
        })
    }

    /// Verify a gateway callback and credit the wallet.
    ///
    /// Idempotent: re-verifying a completed deposit returns the same row
    /// without moving money again. Any reference/amount discrepancy is
    /// fraud-suspect and is never auto-credited.
    pub async fn verify(&self, reference: &str) -> CoreResult<Transaction> {
        let transaction = self
            .store
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("transaction {}", reference)))?;

        match transaction.status {
            TransactionStatus::Completed => {
                info!(reference, "deposit already verified, returning as-is");
                return Ok(transaction);
            }
            TransactionStatus::Pending => {}
            other => {
                return Err(CoreError::InvalidTransition(format!(
                    "deposit {} is {}",
                    reference,
                    other.as_str()
                )));
            }
        }

        let verification = self.gateway.verify_payment(reference).await?;

        if !verification.success {
            self.store
                .mark_transaction(transaction.id, TransactionStatus::Failed)
                .await?;
            return Err(CoreError::ProviderRejected(format!(
                "gateway reported {} for {}",
                verification.status, reference
            )));
        }

        if verification.reference != transaction.reference
            || verification.amount != transaction.amount
        {
            warn!(
                reference,
                expected = %transaction.amount,
                reported = %verification.amount,
                "gateway verification mismatch"
            );
            return Err(CoreError::VerificationMismatch(format!(
                "deposit {}",
                reference
            )));
        }

        self.store.complete_pending_credit(reference).await
    }
}
