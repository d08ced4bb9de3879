//! The operations the storefront calls.
//!
//! [`GroupPurchaseEngine`] wires the services together and resolves the
//! caller through [`Identity`] before anything else runs. Reads that touch
//! a group past its deadline finalize it first, so callers never observe an
//! expired group as ongoing.

use crate::auth::{self, Identity};
use crate::catalog::CatalogPriceLookup;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::events::{DomainEvent, EventBus};
use crate::gateway::PaymentGateway;
use crate::locks::GroupLocks;
use crate::models::{
    confirmed_friend_count, BasketLine, GroupPurchase, Participant, PaymentProof, RefundMethod, SettlementRecord,
    WalletTransaction,
};
use crate::pricing;
use crate::repositories::{
    GroupPurchaseRepository, InMemoryStore, PayoutRepository, PgGroupPurchaseRepository, PgPayoutRepository,
    PgSettlementRepository, PgWalletRepository, SettlementRepository, WalletRepository,
};
use crate::services::{
    AuditTrailService, CheckoutQuote, CheckoutRequest, CheckoutSession, Dispatcher, FinalizationOutcome,
    FinalizationService, GroupService, JoinQuote, JoinService, JoinSession, ProjectedSettlement,
    SecondaryGroupRequest, SettlementCalculator, SweepReport,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Storage seams the engine runs on
#[derive(Clone)]
pub struct Stores {
    pub groups: Arc<dyn GroupPurchaseRepository>,
    pub settlements: Arc<dyn SettlementRepository>,
    pub wallet: Arc<dyn WalletRepository>,
    pub payouts: Arc<dyn PayoutRepository>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            groups: Arc::new(PgGroupPurchaseRepository::new(pool.clone())),
            settlements: Arc::new(PgSettlementRepository::new(pool.clone())),
            wallet: Arc::new(PgWalletRepository::new(pool.clone())),
            payouts: Arc::new(PgPayoutRepository::new(pool)),
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            groups: store.clone(),
            settlements: store.clone(),
            wallet: store.clone(),
            payouts: store,
        }
    }
}

/// Everything a participant page needs about one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    pub group: GroupPurchase,
    pub basket: Vec<BasketLine>,
    pub participants: Vec<Participant>,
    pub confirmed_friend_count: i32,
    /// What the next friend pays; `None` when the group is full or closed
    pub join_price: Option<i64>,
    pub settlement: Option<SettlementRecord>,
    /// Delta per reachable friend count, before any consolidation discount
    pub projection: Vec<ProjectedSettlement>,
}

pub struct EngineBuilder {
    stores: Stores,
    catalog: Arc<dyn CatalogPriceLookup>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    locks: Arc<GroupLocks>,
    audit: Option<Arc<AuditTrailService>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn locks(mut self, locks: Arc<GroupLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn audit(mut self, audit: Arc<AuditTrailService>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> GroupPurchaseEngine {
        let locks = self.locks;
        let stores = self.stores;

        let dispatcher = Arc::new(Dispatcher::new(
            stores.settlements.clone(),
            stores.wallet.clone(),
            stores.payouts.clone(),
            self.gateway.clone(),
            locks.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.audit.clone(),
        ));

        let groups = Arc::new(GroupService::new(
            stores.groups.clone(),
            stores.wallet.clone(),
            self.catalog,
            self.gateway.clone(),
            dispatcher.clone(),
            locks.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.audit.clone(),
            self.config.secondary_grace(),
        ));

        let joins = JoinService::new(
            groups.clone(),
            dispatcher.clone(),
            self.gateway,
            stores.wallet.clone(),
            self.clock.clone(),
        );

        let finalization = Arc::new(FinalizationService::new(
            stores.groups.clone(),
            stores.settlements.clone(),
            SettlementCalculator::new(self.config.consolidation_discount),
            dispatcher.clone(),
            locks,
            self.clock,
            self.events.clone(),
            self.audit,
        ));

        GroupPurchaseEngine {
            stores,
            groups,
            joins,
            finalization,
            dispatcher,
            events: self.events,
            sweep_batch_size: self.config.sweep_batch_size,
        }
    }
}

pub struct GroupPurchaseEngine {
    stores: Stores,
    groups: Arc<GroupService>,
    joins: JoinService,
    finalization: Arc<FinalizationService>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    sweep_batch_size: i64,
}

impl GroupPurchaseEngine {
    pub fn builder(
        stores: Stores,
        catalog: Arc<dyn CatalogPriceLookup>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> EngineBuilder {
        EngineBuilder {
            stores,
            catalog,
            gateway,
            clock: Arc::new(SystemClock),
            events: EventBus::default(),
            locks: Arc::new(GroupLocks::new()),
            audit: None,
            config: EngineConfig::default(),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn sweep_batch_size(&self) -> usize {
        usize::try_from(self.sweep_batch_size).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Finalize the group if its deadline passed; errors are left to the sweeper
    async fn touch(&self, group_id: Uuid) {
        if let Err(e) = self.finalization.expire(group_id).await {
            if !e.is_not_found() {
                warn!(%group_id, error = %e, "Lazy expiry failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    pub async fn quote_checkout(&self, request: &CheckoutRequest) -> AppResult<CheckoutQuote> {
        self.groups.quote_checkout(request).await
    }

    pub async fn begin_checkout(&self, identity: &dyn Identity, request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        let leader = auth::authenticate(identity)?;
        self.groups.begin_checkout(leader, request).await
    }

    pub async fn create_group(
        &self,
        identity: &dyn Identity,
        request: &CheckoutRequest,
        payment_reference: &str,
    ) -> AppResult<GroupPurchase> {
        let leader = auth::authenticate(identity)?;
        self.groups.create(leader, request, payment_reference).await
    }

    pub async fn quote_secondary_group(
        &self,
        identity: &dyn Identity,
        request: &SecondaryGroupRequest,
    ) -> AppResult<CheckoutQuote> {
        let user = auth::authenticate(identity)?;
        self.touch(request.source_group_id).await;
        self.groups.quote_secondary(user, request).await
    }

    pub async fn begin_secondary_checkout(
        &self,
        identity: &dyn Identity,
        request: &SecondaryGroupRequest,
    ) -> AppResult<CheckoutSession> {
        let user = auth::authenticate(identity)?;
        self.touch(request.source_group_id).await;
        self.groups.begin_secondary_checkout(user, request).await
    }

    pub async fn create_secondary_group(
        &self,
        identity: &dyn Identity,
        request: &SecondaryGroupRequest,
        payment_reference: &str,
    ) -> AppResult<GroupPurchase> {
        let user = auth::authenticate(identity)?;
        self.touch(request.source_group_id).await;
        self.groups.create_secondary(user, request, payment_reference).await
    }

    // ------------------------------------------------------------------
    // Group lifecycle
    // ------------------------------------------------------------------

    pub async fn get_group(&self, group_id: Uuid) -> AppResult<GroupView> {
        self.touch(group_id).await;

        let group = self.groups.find(group_id).await?;
        let basket = self.groups.basket(group_id).await?;
        let participants = self.groups.participants(group_id).await?;
        let confirmed = confirmed_friend_count(&participants);

        let join_price = if group.is_ongoing() {
            pricing::join_price(&basket, confirmed, group.kind)?
        } else {
            None
        };
        let settlement = self.stores.settlements.find_settlement(group_id).await?;
        let projection = self.finalization.calculator().project(&group, &basket)?;

        Ok(GroupView {
            group,
            basket,
            participants,
            confirmed_friend_count: confirmed,
            join_price,
            settlement,
            projection,
        })
    }

    pub async fn quote_join(&self, group_id: Uuid) -> AppResult<JoinQuote> {
        self.touch(group_id).await;
        self.joins.quote_join(group_id).await
    }

    pub async fn begin_join(&self, identity: &dyn Identity, group_id: Uuid) -> AppResult<JoinSession> {
        let user = auth::authenticate(identity)?;
        self.joins.begin_join(user, group_id).await
    }

    pub async fn join_group(
        &self,
        identity: &dyn Identity,
        group_id: Uuid,
        proof: &PaymentProof,
    ) -> AppResult<Participant> {
        let user = auth::authenticate(identity)?;
        let result = self.joins.join(user, group_id, proof).await;
        if matches!(result, Err(AppError::GroupExpired(_))) {
            self.touch(group_id).await;
        }
        result
    }

    /// A group already past its deadline expires instead of being cancelled
    pub async fn cancel_group(&self, identity: &dyn Identity, group_id: Uuid) -> AppResult<GroupPurchase> {
        let user = auth::authenticate(identity)?;
        self.touch(group_id).await;
        self.groups.cancel(group_id, user).await
    }

    pub async fn finalize_group(&self, identity: &dyn Identity, group_id: Uuid) -> AppResult<FinalizationOutcome> {
        let user = auth::authenticate(identity)?;
        self.finalization.finalize_by_leader(group_id, user).await
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    pub async fn get_settlement(&self, identity: &dyn Identity, group_id: Uuid) -> AppResult<SettlementRecord> {
        let user = auth::authenticate(identity)?;
        self.touch(group_id).await;

        let record = self.dispatcher.settlement(group_id).await?;
        auth::require_leader(user, record.leader_user_id, "view the settlement")?;
        Ok(record)
    }

    /// Start collecting a positive delta, optionally from the wallet first
    pub async fn pay_settlement(
        &self,
        identity: &dyn Identity,
        group_id: Uuid,
        use_wallet: bool,
    ) -> AppResult<SettlementRecord> {
        let user = auth::authenticate(identity)?;
        self.dispatcher.start_collection(group_id, user, use_wallet).await
    }

    pub async fn confirm_settlement_payment(
        &self,
        identity: &dyn Identity,
        group_id: Uuid,
        reference: &str,
    ) -> AppResult<SettlementRecord> {
        let user = auth::authenticate(identity)?;
        self.dispatcher.confirm_collection(group_id, user, reference).await
    }

    pub async fn submit_refund_method(
        &self,
        identity: &dyn Identity,
        group_id: Uuid,
        method: &RefundMethod,
    ) -> AppResult<SettlementRecord> {
        let user = auth::authenticate(identity)?;
        self.dispatcher.submit_refund_method(group_id, user, method).await
    }

    // ------------------------------------------------------------------
    // Wallet
    // ------------------------------------------------------------------

    pub async fn wallet_balance(&self, identity: &dyn Identity) -> AppResult<i64> {
        let user = auth::authenticate(identity)?;
        Ok(self.stores.wallet.get_balance(user).await?)
    }

    pub async fn wallet_transactions(&self, identity: &dyn Identity) -> AppResult<Vec<WalletTransaction>> {
        let user = auth::authenticate(identity)?;
        Ok(self.stores.wallet.list_transactions(user).await?)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Finalize every group past its deadline (one batch)
    pub async fn sweep_expired(&self) -> AppResult<SweepReport> {
        self.finalization.expire_due(self.sweep_batch_size).await
    }
}
