use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use virtu_core::account::{Direction, NewTransaction, Transaction, TransactionStatus};
use virtu_core::repository::{CommissionRecord, EventSink, NewCommission, ReferralRepository};
use virtu_core::CoreResult;
use virtu_shared::models::events::CommissionEarnedEvent;
use virtu_shared::{money, CommissionSettings};

const TOPIC_COMMISSION_EARNED: &str = "referral.commission.earned";

/// Credits the referrer a cut of each commission-eligible purchase.
///
/// Fires after the purchase debit completes and is strictly best-effort: any
/// failure is logged and swallowed, never rolled into the purchase outcome.
pub struct CommissionTrigger {
    referrals: Arc<dyn ReferralRepository>,
    events: Option<Arc<dyn EventSink>>,
}

impl CommissionTrigger {
    pub fn new(referrals: Arc<dyn ReferralRepository>) -> Self {
        Self {
            referrals,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn on_completed_purchase(
        &self,
        account_id: Uuid,
        transaction: &Transaction,
        settings: &CommissionSettings,
    ) {
        if let Err(err) = self.process(account_id, transaction, settings).await {
            warn!(
                account_id = %account_id,
                transaction_id = %transaction.id,
                error = %err,
                "commission processing failed, purchase unaffected"
            );
        }
    }

    async fn process(
        &self,
        account_id: Uuid,
        transaction: &Transaction,
        settings: &CommissionSettings,
    ) -> CoreResult<()> {
        if transaction.direction != Direction::Debit
            || transaction.status != TransactionStatus::Completed
        {
            return Ok(());
        }

        let Some(referrer_id) = self.referrals.referrer_of(account_id).await? else {
            return Ok(());
        };

        let earned = self.referrals.commission_count(account_id).await?;
        if earned >= settings.max_purchases {
            return Ok(());
        }

        let amount = money::round(transaction.amount * settings.rate);
        if amount <= Decimal::ZERO {
            return Ok(());
        }

        let record = self
            .referrals
            .record_commission(
                NewCommission {
                    referred_account_id: account_id,
                    referrer_account_id: referrer_id,
                    source_transaction_id: transaction.id,
                    amount,
                },
                NewTransaction::new(
                    Direction::Credit,
                    amount,
                    "commission",
                    "Referral commission",
                ),
            )
            .await?;

        info!(
            referrer = %referrer_id,
            referred = %account_id,
            amount = %record.amount,
            "referral commission credited"
        );
        self.emit_commission_earned(&record).await;
        Ok(())
    }

    async fn emit_commission_earned(&self, record: &CommissionRecord) {
        let Some(events) = &self.events else {
            return;
        };
        let event = CommissionEarnedEvent {
            referrer_account_id: record.referrer_account_id,
            referred_account_id: record.referred_account_id,
            source_transaction_id: record.source_transaction_id,
            amount: record.amount,
            timestamp: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(commission_id = %record.id, error = %err, "event serialization failed");
                return;
            }
        };
        if let Err(err) = events
            .publish(
                TOPIC_COMMISSION_EARNED,
                &record.referrer_account_id.to_string(),
                &payload,
            )
            .await
        {
            warn!(commission_id = %record.id, error = %err, "event publish failed");
        }
    }
}
