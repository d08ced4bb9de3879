//! Executes a computed settlement exactly once.
//!
//! Every payout path follows the same shape: reserve the intent on the
//! settlement record (version compare-and-set) while holding the group lock,
//! release the lock for the external call, then take the lock again to
//! commit or roll the reservation back. Wallet movements and payouts carry
//! server-persisted idempotency keys, so a retried or concurrent call can
//! never move money twice.

use crate::auth;
use crate::clock::Clock;
use crate::error::{AppError, AppResult, RepositoryError};
use crate::events::{DomainEvent, EventBus};
use crate::gateway::{ChargePurpose, ChargeRequest, PaymentGateway};
use crate::locks::GroupLocks;
use crate::models::{
    BankCardPayout, CardNumber, IdempotencyKey, PendingOperation, RefundMethod, SettlementDirection,
    SettlementMethod, SettlementRecord, WalletTransaction, WalletTransactionType,
};
use crate::repositories::{PayoutRepository, SettlementRepository, WalletRepository};
use crate::services::audit::{self, AuditTrailService};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Dispatcher {
    settlements: Arc<dyn SettlementRepository>,
    wallet: Arc<dyn WalletRepository>,
    payouts: Arc<dyn PayoutRepository>,
    gateway: Arc<dyn PaymentGateway>,
    locks: Arc<GroupLocks>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    audit: Option<Arc<AuditTrailService>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settlements: Arc<dyn SettlementRepository>,
        wallet: Arc<dyn WalletRepository>,
        payouts: Arc<dyn PayoutRepository>,
        gateway: Arc<dyn PaymentGateway>,
        locks: Arc<GroupLocks>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        audit: Option<Arc<AuditTrailService>>,
    ) -> Self {
        Self {
            settlements,
            wallet,
            payouts,
            gateway,
            locks,
            clock,
            events,
            audit,
        }
    }

    pub async fn settlement(&self, group_id: Uuid) -> AppResult<SettlementRecord> {
        self.settlements
            .find_settlement(group_id)
            .await?
            .ok_or(AppError::SettlementNotFound(group_id))
    }

    async fn store(&self, record: &SettlementRecord) -> AppResult<SettlementRecord> {
        self.settlements.update_settlement(record).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => AppError::DuplicateSettlement(record.group_id),
            other => other.into(),
        })
    }

    /// Settle an even record directly; otherwise start the path its sign calls for.
    ///
    /// A positive delta opens the collection charge; a negative one returns the
    /// record unchanged until the leader picks a refund method.
    pub async fn dispatch(&self, group_id: Uuid) -> AppResult<SettlementRecord> {
        let guard = self.locks.acquire(group_id).await;
        let mut record = self.settlement(group_id).await?;
        if record.is_settled() {
            return Err(AppError::DuplicateSettlement(group_id));
        }

        match record.direction() {
            SettlementDirection::Even => {
                record.settle(SettlementMethod::None, self.clock.now())?;
                let stored = self.store(&record).await?;
                drop(guard);

                info!(%group_id, "Settlement closed with zero delta");
                self.announce(&stored, None).await;
                Ok(stored)
            }
            SettlementDirection::Collect => {
                drop(guard);
                self.start_collection(group_id, record.leader_user_id, false).await
            }
            SettlementDirection::Refund => Ok(record),
        }
    }

    /// Collect a positive delta, optionally covering part of it from the
    /// leader's wallet first. The gateway charge for the remainder is opened
    /// once and re-used by every retry.
    pub async fn start_collection(
        &self,
        group_id: Uuid,
        requested_by: Uuid,
        use_wallet: bool,
    ) -> AppResult<SettlementRecord> {
        let guard = self.locks.acquire(group_id).await;
        let mut record = self.settlement(group_id).await?;
        auth::require_leader(requested_by, record.leader_user_id, "pay this settlement")?;

        if record.is_settled() {
            return Err(AppError::DuplicateSettlement(group_id));
        }
        if record.direction() != SettlementDirection::Collect {
            return Err(AppError::Validation(format!(
                "nothing to collect for group {} (delta {})",
                group_id, record.delta
            )));
        }
        if record.gateway_reference.is_some() && record.pending_operation.is_none() {
            return Ok(record);
        }

        // An interrupted debit is resumed even if the retry did not ask for the wallet
        let debit_wallet = record.pending_operation == Some(PendingOperation::WalletDebit)
            || (use_wallet && record.wallet_applied == 0);
        let operation = if debit_wallet {
            PendingOperation::WalletDebit
        } else {
            PendingOperation::GatewayCharge
        };
        record.reserve(operation)?;
        let mut record = self.store(&record).await?;
        drop(guard);

        if debit_wallet {
            let debited = match self.debit_wallet(&record).await {
                Ok(amount) => amount,
                Err(e) => {
                    self.roll_back(group_id, PendingOperation::WalletDebit).await;
                    return Err(e);
                }
            };

            let guard = self.locks.acquire(group_id).await;
            let mut fresh = self.settlement(group_id).await?;
            fresh.wallet_applied = debited;

            if fresh.outstanding() == 0 {
                fresh.settle(SettlementMethod::Wallet, self.clock.now())?;
                let stored = self.store(&fresh).await?;
                drop(guard);

                info!(%group_id, debited, "Settlement collected from wallet");
                self.announce(&stored, None).await;
                return Ok(stored);
            }

            fresh.release();
            fresh.reserve(PendingOperation::GatewayCharge)?;
            record = self.store(&fresh).await?;
            drop(guard);
        }

        let amount = record.outstanding();
        let request = ChargeRequest {
            payer_user_id: record.leader_user_id,
            group_id: Some(group_id),
            amount,
            purpose: ChargePurpose::Settlement,
            // Bound to the amount so a changed remainder can never reuse a stale charge
            idempotency_key: IdempotencyKey::settlement(group_id, &format!("gateway_charge:{}", amount)).to_string(),
        };

        let session = match self.gateway.create_charge(&request).await {
            Ok(session) => session,
            Err(e) => {
                warn!(%group_id, error = %e, "Could not open settlement charge");
                self.roll_back(group_id, PendingOperation::GatewayCharge).await;
                return Err(e.into());
            }
        };

        let _guard = self.locks.acquire(group_id).await;
        let mut fresh = self.settlement(group_id).await?;
        if fresh.is_settled() {
            return Err(AppError::DuplicateSettlement(group_id));
        }
        fresh.gateway_reference = Some(session.reference.clone());
        fresh.gateway_amount = Some(amount);
        fresh.payment_url = Some(session.payment_url);
        fresh.release();
        let stored = self.store(&fresh).await?;

        info!(%group_id, amount, reference = %session.reference, "Settlement charge opened");
        Ok(stored)
    }

    /// Debit `min(balance, outstanding)`; a replayed debit reports the amount it
    /// originally took
    async fn debit_wallet(&self, record: &SettlementRecord) -> AppResult<i64> {
        let key = IdempotencyKey::settlement(record.group_id, PendingOperation::WalletDebit.as_str());
        let wallet_err = |e: RepositoryError| AppError::WalletCreditFailed(format!("wallet debit failed: {}", e));

        if let Some(previous) = self.wallet.find_transaction(&key).await.map_err(wallet_err)? {
            return Ok(-previous.amount);
        }

        let balance = self.wallet.get_balance(record.leader_user_id).await.map_err(wallet_err)?;
        let amount = balance.min(record.outstanding());
        if amount <= 0 {
            return Ok(0);
        }

        let adjustment = self
            .wallet
            .adjust_balance(
                record.leader_user_id,
                -amount,
                WalletTransactionType::SettlementDebit,
                &key,
                Some("group purchase settlement"),
            )
            .await
            .map_err(wallet_err)?;

        Ok(-adjustment.transaction.amount)
    }

    /// Commit a confirmed settlement charge
    pub async fn confirm_collection(
        &self,
        group_id: Uuid,
        requested_by: Uuid,
        reference: &str,
    ) -> AppResult<SettlementRecord> {
        let record = {
            let _guard = self.locks.acquire(group_id).await;
            let record = self.settlement(group_id).await?;
            auth::require_leader(requested_by, record.leader_user_id, "pay this settlement")?;
            if record.is_settled() {
                return Err(AppError::DuplicateSettlement(group_id));
            }
            if record.gateway_reference.as_deref() != Some(reference) {
                return Err(AppError::Validation(format!(
                    "payment {} does not belong to the settlement of group {}",
                    reference, group_id
                )));
            }
            record
        };

        let verification = self.gateway.verify_charge(reference).await?;
        if !verification.is_valid_for(ChargePurpose::Settlement, record.leader_user_id) {
            return Err(AppError::PaymentNotConfirmed(format!("charge {} is not paid", reference)));
        }
        if !verification.is_for_group(group_id) {
            return Err(AppError::PaymentNotConfirmed(format!(
                "charge {} was opened for another group",
                reference
            )));
        }
        let expected = record.gateway_amount.unwrap_or_else(|| record.outstanding());
        if verification.amount < expected {
            return Err(AppError::PaymentNotConfirmed(format!(
                "charge {} captured {} of {}",
                reference, verification.amount, expected
            )));
        }

        let guard = self.locks.acquire(group_id).await;
        let mut fresh = self.settlement(group_id).await?;
        fresh.settle(SettlementMethod::GatewayCharge, self.clock.now())?;
        let stored = self.store(&fresh).await?;
        drop(guard);

        info!(%group_id, reference, "Settlement charge confirmed");
        self.announce(&stored, None).await;
        Ok(stored)
    }

    /// Pay out a negative delta by the leader's chosen method
    pub async fn submit_refund_method(
        &self,
        group_id: Uuid,
        requested_by: Uuid,
        method: &RefundMethod,
    ) -> AppResult<SettlementRecord> {
        // Card is validated before anything is reserved
        let card = match method {
            RefundMethod::Wallet => None,
            RefundMethod::BankCard { card_number } => Some(CardNumber::parse(card_number)?),
        };
        let operation = if card.is_some() {
            PendingOperation::BankCard
        } else {
            PendingOperation::WalletCredit
        };

        let record = {
            let _guard = self.locks.acquire(group_id).await;
            let mut record = self.settlement(group_id).await?;
            auth::require_leader(requested_by, record.leader_user_id, "choose a refund method")?;
            if record.is_settled() {
                return Err(AppError::DuplicateSettlement(group_id));
            }
            if record.direction() != SettlementDirection::Refund {
                return Err(AppError::RefundNotApplicable(group_id));
            }
            record.reserve(operation)?;
            self.store(&record).await?
        };

        let outcome = match &card {
            None => self.credit_wallet(&record).await.map(|_| ()),
            Some(card) => self.queue_payout(&record, card).await.map(|_| ()),
        };
        if let Err(e) = outcome {
            self.roll_back(group_id, operation).await;
            return Err(e);
        }

        let settled_method = if card.is_some() {
            SettlementMethod::BankCardQueued
        } else {
            SettlementMethod::Wallet
        };

        let guard = self.locks.acquire(group_id).await;
        let mut fresh = self.settlement(group_id).await?;
        fresh.settle(settled_method, self.clock.now())?;
        let stored = self.store(&fresh).await?;
        drop(guard);

        let masked = card.as_ref().map(CardNumber::masked);
        info!(
            %group_id,
            method = settled_method.as_str(),
            amount = stored.refund_amount(),
            "Settlement refund dispatched"
        );
        self.announce(&stored, masked.as_deref()).await;
        Ok(stored)
    }

    async fn credit_wallet(&self, record: &SettlementRecord) -> AppResult<WalletTransaction> {
        let key = IdempotencyKey::settlement(record.group_id, PendingOperation::WalletCredit.as_str());
        let adjustment = self
            .wallet
            .adjust_balance(
                record.leader_user_id,
                record.refund_amount(),
                WalletTransactionType::SettlementRefund,
                &key,
                Some("group purchase refund"),
            )
            .await
            .map_err(|e| {
                error!(group_id = %record.group_id, error = %e, "Wallet credit failed");
                AppError::WalletCreditFailed(e.to_string())
            })?;

        Ok(adjustment.transaction)
    }

    async fn queue_payout(&self, record: &SettlementRecord, card: &CardNumber) -> AppResult<BankCardPayout> {
        let key = IdempotencyKey::settlement(record.group_id, PendingOperation::BankCard.as_str());
        let payout = BankCardPayout::queued(
            record.group_id,
            record.leader_user_id,
            card,
            record.refund_amount(),
            key.as_str(),
            self.clock.now(),
        );

        match self.payouts.enqueue_payout(&payout).await {
            Ok(queued) => Ok(queued),
            Err(RepositoryError::Duplicate(msg)) => {
                // Lost a race to a writer queueing this same payout
                match self.payouts.find_payout_by_group(record.group_id).await? {
                    Some(existing)
                        if existing.idempotency_key == payout.idempotency_key && existing.amount == payout.amount =>
                    {
                        info!(group_id = %record.group_id, payout_id = %existing.id, "Bank card payout already queued");
                        Ok(existing)
                    }
                    _ => {
                        warn!(group_id = %record.group_id, "Conflicting bank card payout: {}", msg);
                        Err(AppError::DuplicateSettlement(record.group_id))
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Undo a reservation after its external call failed; the record is left
    /// unsettled so the caller may retry
    async fn roll_back(&self, group_id: Uuid, operation: PendingOperation) {
        let _guard = self.locks.acquire(group_id).await;
        let result = async {
            let mut record = self.settlement(group_id).await?;
            if record.pending_operation == Some(operation) {
                record.release();
                self.store(&record).await?;
            }
            Ok::<_, AppError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(%group_id, operation = operation.as_str(), error = %e, "Could not release settlement intent");
        }
    }

    /// Credit back a confirmed join payment the group could not accept
    pub async fn refund_rejected_join(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        reference: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<WalletTransaction> {
        let transaction = self
            .refund_payment(
                user_id,
                amount,
                WalletTransactionType::JoinRefund,
                &IdempotencyKey::join_refund(reference),
                reason,
            )
            .await?;

        self.events.publish(DomainEvent::JoinRefunded {
            group_id,
            user_id,
            amount: transaction.amount,
            reason: reason.to_string(),
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_wallet_refund(Some(group_id), &transaction, reason).await);
        }
        Ok(transaction)
    }

    /// Credit back what a friend paid above the price their join was counted at.
    ///
    /// Keyed by the payment reference, so a replayed join never credits twice.
    pub async fn refund_join_overpayment(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        reference: &str,
        surplus: i64,
    ) -> AppResult<WalletTransaction> {
        let key = IdempotencyKey::join_overpay(reference);
        let already_credited = self.wallet.find_transaction(&key).await?.is_some();

        let transaction = self
            .refund_payment(
                user_id,
                surplus,
                WalletTransactionType::JoinOverpayRefund,
                &key,
                "join_overpaid",
            )
            .await?;

        if !already_credited {
            self.events.publish(DomainEvent::JoinRefunded {
                group_id,
                user_id,
                amount: transaction.amount,
                reason: "join_overpaid".to_string(),
            });
            if let Some(trail) = &self.audit {
                audit::report(trail.log_wallet_refund(Some(group_id), &transaction, "join_overpaid").await);
            }
        }
        Ok(transaction)
    }

    /// Credit back a checkout payment that could not open a group
    pub async fn refund_rejected_checkout(
        &self,
        user_id: Uuid,
        reference: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<WalletTransaction> {
        let transaction = self
            .refund_payment(
                user_id,
                amount,
                WalletTransactionType::CheckoutRefund,
                &IdempotencyKey::checkout_refund(reference),
                reason,
            )
            .await?;

        if let Some(trail) = &self.audit {
            audit::report(trail.log_wallet_refund(None, &transaction, reason).await);
        }
        Ok(transaction)
    }

    async fn refund_payment(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: WalletTransactionType,
        key: &IdempotencyKey,
        reason: &str,
    ) -> AppResult<WalletTransaction> {
        if amount <= 0 {
            return Err(AppError::Validation(format!("refund amount must be positive, got {}", amount)));
        }

        let adjustment = self
            .wallet
            .adjust_balance(user_id, amount, kind, key, Some(reason))
            .await
            .map_err(|e| {
                error!(%user_id, key = %key, error = %e, "Refund of rejected payment failed");
                AppError::WalletCreditFailed(e.to_string())
            })?;

        if adjustment.applied {
            info!(%user_id, amount, key = %key, reason, "Rejected payment refunded to wallet");
        }
        Ok(adjustment.transaction)
    }

    async fn announce(&self, record: &SettlementRecord, card_masked: Option<&str>) {
        self.events.publish(DomainEvent::GroupSettled {
            group_id: record.group_id,
            leader_user_id: record.leader_user_id,
            method: record.method,
            delta: record.delta,
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_settlement_dispatched(record, card_masked).await);
        }
    }
}
