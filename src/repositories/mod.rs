//! Persistence seams for groups, settlements, wallets and payouts.
//!
//! Each trait has a Postgres implementation and an in-memory one
//! ([`memory::InMemoryStore`]) used by tests and `STORAGE=memory`.

pub mod group_purchase_repository;
pub mod memory;
pub mod payout_repository;
pub mod settlement_repository;
pub mod wallet_repository;

pub use group_purchase_repository::PgGroupPurchaseRepository;
pub use memory::InMemoryStore;
pub use payout_repository::PgPayoutRepository;
pub use settlement_repository::PgSettlementRepository;
pub use wallet_repository::PgWalletRepository;

use crate::error::RepoResult;
use crate::models::{
    BankCardPayout, BasketLine, GroupPurchase, IdempotencyKey, Participant, SettlementRecord, StatusTransition,
    WalletAdjustment, WalletTransaction, WalletTransactionType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait GroupPurchaseRepository: Send + Sync {
    /// Insert a new group with its basket snapshot and leader row.
    ///
    /// Fails with `Duplicate` when the checkout payment reference was already
    /// used, or when the requester already opened a secondary group for the
    /// same source.
    async fn insert_group(
        &self,
        group: &GroupPurchase,
        basket: &[BasketLine],
        leader: &Participant,
    ) -> RepoResult<()>;

    async fn find_group(&self, group_id: Uuid) -> RepoResult<Option<GroupPurchase>>;

    async fn find_basket(&self, group_id: Uuid) -> RepoResult<Vec<BasketLine>>;

    async fn find_participants(&self, group_id: Uuid) -> RepoResult<Vec<Participant>>;

    async fn find_participant_by_payment(&self, reference: &str) -> RepoResult<Option<Participant>>;

    /// Append a paid friend, only while the group is still ongoing.
    ///
    /// `BusinessRule` if the group is terminal, `Duplicate` if the payment
    /// reference or the user is already recorded.
    async fn append_paid_participant(&self, participant: &Participant) -> RepoResult<()>;

    /// Atomically commit a terminal transition (and the settlement of a
    /// successful group).
    ///
    /// `group` carries the new status and frozen friend count. Returns
    /// `false` without writing anything if the group already left the
    /// ongoing state; `Conflict` if the stored paid-friend tally no longer
    /// matches the frozen count.
    async fn commit_transition(
        &self,
        group: &GroupPurchase,
        transition: &StatusTransition,
        settlement: Option<&SettlementRecord>,
    ) -> RepoResult<bool>;

    async fn find_transitions(&self, group_id: Uuid) -> RepoResult<Vec<StatusTransition>>;

    /// Ongoing groups whose deadline is at or before `now`, oldest first
    async fn find_expired_ongoing(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>>;

    async fn find_secondary_of(&self, source_group_id: Uuid, leader_user_id: Uuid)
        -> RepoResult<Option<GroupPurchase>>;
}

#[async_trait]
pub trait SettlementRepository: Send + Sync {
    async fn find_settlement(&self, group_id: Uuid) -> RepoResult<Option<SettlementRecord>>;

    /// Compare-and-set on `record.version`; returns the stored record with
    /// the bumped version, or `Conflict` when someone else wrote first.
    async fn update_settlement(&self, record: &SettlementRecord) -> RepoResult<SettlementRecord>;
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Zero for users who never had a wallet movement
    async fn get_balance(&self, user_id: Uuid) -> RepoResult<i64>;

    /// Apply a signed amount exactly once per idempotency key.
    ///
    /// A replayed key returns the original transaction with
    /// `applied = false`; a key reused for a different user or amount is a
    /// `Duplicate`. Debits beyond the balance fail with `BusinessRule`.
    async fn adjust_balance(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: WalletTransactionType,
        key: &IdempotencyKey,
        description: Option<&str>,
    ) -> RepoResult<WalletAdjustment>;

    async fn find_transaction(&self, key: &IdempotencyKey) -> RepoResult<Option<WalletTransaction>>;

    async fn list_transactions(&self, user_id: Uuid) -> RepoResult<Vec<WalletTransaction>>;
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    /// Queue a bank-card refund. Replaying the same idempotency key returns
    /// the stored payout; a second payout for the group is a `Duplicate`.
    async fn enqueue_payout(&self, payout: &BankCardPayout) -> RepoResult<BankCardPayout>;

    async fn find_payout_by_group(&self, group_id: Uuid) -> RepoResult<Option<BankCardPayout>>;

    async fn list_queued_payouts(&self, limit: i64) -> RepoResult<Vec<BankCardPayout>>;
}
