use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use virtu_core::account::{Account, Direction, NewAccount, NewTransaction, Transaction};
use virtu_core::repository::LedgerRepository;
use virtu_core::{CoreError, CoreResult};

/// Owns balance mutation and the transaction log. Every mutation goes through
/// the repository's compound atomic operations; the service never mutates a
/// balance it read earlier.
pub struct Ledger {
    store: Arc<dyn LedgerRepository>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerRepository>) -> Self {
        Self { store }
    }

    /// Open a wallet. Assigning the referral code and resolving the referrer
    /// link are explicit steps of this use case, not persistence hooks.
    pub async fn open_account(
        &self,
        owner: &str,
        referred_by_code: Option<&str>,
    ) -> CoreResult<Account> {
        let referred_by = match referred_by_code {
            Some(code) => {
                let referrer = self.store.find_account_by_referral_code(code).await?;
                if referrer.is_none() {
                    warn!(code, "unknown referral code, opening account without link");
                }
                referrer.map(|a| a.id)
            }
            None => None,
        };

        self.store
            .insert_account(NewAccount {
                owner: owner.to_string(),
                referral_code: generate_referral_code(),
                referred_by,
            })
            .await
    }

    pub async fn account(&self, id: Uuid) -> CoreResult<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("account {}", id)))
    }

    /// Advisory pre-check; `debit` re-checks atomically and is the only
    /// authority on sufficiency.
    pub async fn has_sufficient_balance(
        &self,
        account_id: Uuid,
        amount: Decimal,
    ) -> CoreResult<bool> {
        Ok(self.account(account_id).await?.balance >= amount)
    }

    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> CoreResult<Transaction> {
        validate_amount(amount)?;
        self.store
            .debit_and_record(
                account_id,
                NewTransaction::new(Direction::Debit, amount, "wallet", description),
            )
            .await
    }

    /// Unconditional credit: deposits, refunds, commissions.
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> CoreResult<Transaction> {
        validate_amount(amount)?;
        self.store
            .credit_and_record(
                account_id,
                NewTransaction::new(Direction::Credit, amount, "wallet", description),
            )
            .await
    }

    pub async fn transactions(&self, account_id: Uuid) -> CoreResult<Vec<Transaction>> {
        self.store.list_transactions(account_id).await
    }
}

fn validate_amount(amount: Decimal) -> CoreResult<()> {
    if amount <= Decimal::ZERO {
        return Err(CoreError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Format: REF-{short_uuid}
fn generate_referral_code() -> String {
    format!(
        "REF-{}",
        Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}
