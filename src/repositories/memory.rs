//! In-process store backing every repository trait.
//!
//! Mirrors the Postgres constraints (unique payment references, one payout
//! per group, conditional status writes, settlement version checks) so the
//! engine behaves the same on either backend.

use super::wallet_repository::check_replay;
use super::{GroupPurchaseRepository, PayoutRepository, SettlementRepository, WalletRepository};
use crate::error::{RepoResult, RepositoryError};
use crate::models::{
    confirmed_friend_count, BankCardPayout, BasketLine, GroupPurchase, GroupStatus, IdempotencyKey, Participant,
    PayoutStatus, SettlementRecord, StatusTransition, WalletAdjustment, WalletBalance, WalletTransaction,
    WalletTransactionType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    groups: HashMap<Uuid, GroupPurchase>,
    baskets: HashMap<Uuid, Vec<BasketLine>>,
    participants: HashMap<Uuid, Vec<Participant>>,
    transitions: Vec<StatusTransition>,
    settlements: HashMap<Uuid, SettlementRecord>,
    balances: HashMap<Uuid, WalletBalance>,
    wallet_transactions: Vec<WalletTransaction>,
    payouts: HashMap<Uuid, BankCardPayout>,
}

impl State {
    fn payment_reference_used(&self, reference: &str) -> bool {
        self.participants
            .values()
            .flatten()
            .any(|p| p.payment_reference.as_deref() == Some(reference))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    wallet_offline: AtomicBool,
    payout_race_lost: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every wallet movement fail as if the database were unreachable
    pub fn set_wallet_offline(&self, offline: bool) {
        self.wallet_offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next payout insert lose a race: a concurrent writer stores
    /// the same payout first and this call sees the group's unique index
    pub fn lose_next_payout_race(&self) {
        self.payout_race_lost.store(true, Ordering::SeqCst);
    }

    /// Seed a wallet balance directly
    pub fn set_balance(&self, user_id: Uuid, balance: i64) {
        self.state().balances.insert(
            user_id,
            WalletBalance {
                user_id,
                balance,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn wallet_transaction_count(&self) -> usize {
        self.state().wallet_transactions.len()
    }

    pub fn settlement_count(&self) -> usize {
        self.state().settlements.len()
    }
}

#[async_trait]
impl GroupPurchaseRepository for InMemoryStore {
    async fn insert_group(
        &self,
        group: &GroupPurchase,
        basket: &[BasketLine],
        leader: &Participant,
    ) -> RepoResult<()> {
        let mut state = self.state();

        if state.groups.contains_key(&group.id) {
            return Err(RepositoryError::Duplicate(format!("group {}", group.id)));
        }
        if state
            .groups
            .values()
            .any(|g| g.leader_payment_reference == group.leader_payment_reference)
            || state.payment_reference_used(&group.leader_payment_reference)
        {
            return Err(RepositoryError::Duplicate(format!(
                "payment reference {}",
                group.leader_payment_reference
            )));
        }
        if let Some(source) = group.source_group_id {
            if !state.groups.contains_key(&source) {
                return Err(RepositoryError::ConstraintViolation(format!("source group {}", source)));
            }
            if state
                .groups
                .values()
                .any(|g| g.source_group_id == Some(source) && g.leader_user_id == group.leader_user_id)
            {
                return Err(RepositoryError::Duplicate(format!(
                    "secondary group of {} for {}",
                    source, group.leader_user_id
                )));
            }
        }

        state.groups.insert(group.id, group.clone());
        state.baskets.insert(group.id, basket.to_vec());
        state.participants.insert(group.id, vec![leader.clone()]);
        Ok(())
    }

    async fn find_group(&self, group_id: Uuid) -> RepoResult<Option<GroupPurchase>> {
        Ok(self.state().groups.get(&group_id).cloned())
    }

    async fn find_basket(&self, group_id: Uuid) -> RepoResult<Vec<BasketLine>> {
        Ok(self.state().baskets.get(&group_id).cloned().unwrap_or_default())
    }

    async fn find_participants(&self, group_id: Uuid) -> RepoResult<Vec<Participant>> {
        Ok(self.state().participants.get(&group_id).cloned().unwrap_or_default())
    }

    async fn find_participant_by_payment(&self, reference: &str) -> RepoResult<Option<Participant>> {
        Ok(self
            .state()
            .participants
            .values()
            .flatten()
            .find(|p| p.payment_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn append_paid_participant(&self, participant: &Participant) -> RepoResult<()> {
        let mut state = self.state();

        let status = state
            .groups
            .get(&participant.group_id)
            .map(|g| g.status)
            .ok_or_else(|| RepositoryError::NotFound(format!("group {}", participant.group_id)))?;
        if status != GroupStatus::Ongoing {
            return Err(RepositoryError::BusinessRule(format!(
                "group {} is {}",
                participant.group_id, status
            )));
        }

        if let Some(reference) = participant.payment_reference.as_deref() {
            if state.payment_reference_used(reference)
                || state.groups.values().any(|g| g.leader_payment_reference == reference)
            {
                return Err(RepositoryError::Duplicate(format!("payment reference {}", reference)));
            }
        }

        let roster = state.participants.entry(participant.group_id).or_default();
        if participant.user_id.is_some() && roster.iter().any(|p| p.user_id == participant.user_id) {
            return Err(RepositoryError::Duplicate(format!(
                "participant {:?} in group {}",
                participant.user_id, participant.group_id
            )));
        }
        roster.push(participant.clone());
        Ok(())
    }

    async fn commit_transition(
        &self,
        group: &GroupPurchase,
        transition: &StatusTransition,
        settlement: Option<&SettlementRecord>,
    ) -> RepoResult<bool> {
        let mut state = self.state();

        let stored_status = state
            .groups
            .get(&group.id)
            .map(|g| g.status)
            .ok_or_else(|| RepositoryError::NotFound(format!("group {}", group.id)))?;
        if stored_status != GroupStatus::Ongoing {
            return Ok(false);
        }

        let tally = state
            .participants
            .get(&group.id)
            .map(|roster| confirmed_friend_count(roster))
            .unwrap_or(0);
        let frozen = group.actual_friend_count.unwrap_or_default();
        if tally != frozen {
            return Err(RepositoryError::Conflict(format!(
                "group {} has {} paid friends, finalization counted {}",
                group.id, tally, frozen
            )));
        }

        if let Some(record) = settlement {
            if state.settlements.contains_key(&record.group_id) {
                return Err(RepositoryError::Duplicate(format!("settlement {}", record.group_id)));
            }
            state.settlements.insert(record.group_id, record.clone());
        }

        state.groups.insert(group.id, group.clone());
        state.transitions.push(transition.clone());
        Ok(true)
    }

    async fn find_transitions(&self, group_id: Uuid) -> RepoResult<Vec<StatusTransition>> {
        Ok(self
            .state()
            .transitions
            .iter()
            .filter(|t| t.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn find_expired_ongoing(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>> {
        let state = self.state();
        let mut due: Vec<&GroupPurchase> = state.groups.values().filter(|g| g.is_due_for_expiry(now)).collect();
        due.sort_by_key(|g| g.expires_at);

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|g| g.id)
            .collect())
    }

    async fn find_secondary_of(
        &self,
        source_group_id: Uuid,
        leader_user_id: Uuid,
    ) -> RepoResult<Option<GroupPurchase>> {
        Ok(self
            .state()
            .groups
            .values()
            .find(|g| g.source_group_id == Some(source_group_id) && g.leader_user_id == leader_user_id)
            .cloned())
    }
}

#[async_trait]
impl SettlementRepository for InMemoryStore {
    async fn find_settlement(&self, group_id: Uuid) -> RepoResult<Option<SettlementRecord>> {
        Ok(self.state().settlements.get(&group_id).cloned())
    }

    async fn update_settlement(&self, record: &SettlementRecord) -> RepoResult<SettlementRecord> {
        let mut state = self.state();

        let stored = state
            .settlements
            .get_mut(&record.group_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("settlement {}", record.group_id)))?;
        if stored.version != record.version {
            return Err(RepositoryError::Conflict(format!(
                "settlement {} is not at version {}",
                record.group_id, record.version
            )));
        }

        stored.method = record.method;
        stored.wallet_applied = record.wallet_applied;
        stored.pending_operation = record.pending_operation;
        stored.gateway_reference = record.gateway_reference.clone();
        stored.gateway_amount = record.gateway_amount;
        stored.payment_url = record.payment_url.clone();
        stored.settled_at = record.settled_at;
        stored.version += 1;

        Ok(stored.clone())
    }
}

#[async_trait]
impl WalletRepository for InMemoryStore {
    async fn get_balance(&self, user_id: Uuid) -> RepoResult<i64> {
        Ok(self.state().balances.get(&user_id).map(|b| b.balance).unwrap_or(0))
    }

    async fn adjust_balance(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: WalletTransactionType,
        key: &IdempotencyKey,
        description: Option<&str>,
    ) -> RepoResult<WalletAdjustment> {
        if self.wallet_offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Query(sqlx::Error::PoolTimedOut));
        }

        let mut state = self.state();

        if let Some(existing) = state
            .wallet_transactions
            .iter()
            .find(|t| t.idempotency_key == key.as_str())
        {
            return check_replay(existing.clone(), user_id, amount);
        }

        let now = Utc::now();
        let balance_before = state.balances.get(&user_id).map(|b| b.balance).unwrap_or(0);
        let balance_after = balance_before
            .checked_add(amount)
            .ok_or_else(|| RepositoryError::InvalidInput("wallet balance overflow".to_string()))?;
        if balance_after < 0 {
            return Err(RepositoryError::BusinessRule(format!(
                "insufficient wallet balance: have {}, need {}",
                balance_before, -amount
            )));
        }

        state.balances.insert(
            user_id,
            WalletBalance {
                user_id,
                balance: balance_after,
                updated_at: now,
            },
        );

        let transaction = WalletTransaction {
            id: Uuid::new_v4(),
            user_id,
            amount,
            balance_before,
            balance_after,
            kind,
            idempotency_key: key.as_str().to_string(),
            description: description.map(str::to_string),
            created_at: now,
        };
        state.wallet_transactions.push(transaction.clone());

        Ok(WalletAdjustment {
            transaction,
            applied: true,
        })
    }

    async fn find_transaction(&self, key: &IdempotencyKey) -> RepoResult<Option<WalletTransaction>> {
        Ok(self
            .state()
            .wallet_transactions
            .iter()
            .find(|t| t.idempotency_key == key.as_str())
            .cloned())
    }

    async fn list_transactions(&self, user_id: Uuid) -> RepoResult<Vec<WalletTransaction>> {
        Ok(self
            .state()
            .wallet_transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn enqueue_payout(&self, payout: &BankCardPayout) -> RepoResult<BankCardPayout> {
        let mut state = self.state();

        if self.payout_race_lost.swap(false, Ordering::SeqCst) {
            state.payouts.entry(payout.group_id).or_insert_with(|| payout.clone());
            return Err(RepositoryError::Duplicate(format!("payout for group {}", payout.group_id)));
        }

        if let Some(existing) = state.payouts.values().find(|p| p.idempotency_key == payout.idempotency_key) {
            if existing.group_id != payout.group_id || existing.amount != payout.amount {
                return Err(RepositoryError::Duplicate(format!(
                    "idempotency key {} already used for another payout",
                    payout.idempotency_key
                )));
            }
            return Ok(existing.clone());
        }
        if state.payouts.contains_key(&payout.group_id) {
            return Err(RepositoryError::Duplicate(format!("payout for group {}", payout.group_id)));
        }

        state.payouts.insert(payout.group_id, payout.clone());
        Ok(payout.clone())
    }

    async fn find_payout_by_group(&self, group_id: Uuid) -> RepoResult<Option<BankCardPayout>> {
        Ok(self.state().payouts.get(&group_id).cloned())
    }

    async fn list_queued_payouts(&self, limit: i64) -> RepoResult<Vec<BankCardPayout>> {
        let state = self.state();
        let mut queued: Vec<BankCardPayout> = state
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|p| p.queued_at);
        queued.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(queued)
    }
}
