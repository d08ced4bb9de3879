use crate::auth;
use crate::catalog::CatalogPriceLookup;
use crate::clock::Clock;
use crate::error::{AppError, AppResult, RepositoryError};
use crate::events::{DomainEvent, EventBus};
use crate::gateway::{ChargePurpose, ChargeRequest, ChargeSession, PaymentGateway};
use crate::locks::GroupLocks;
use crate::models::{
    confirmed_friend_count, BasketItemRequest, BasketLine, GroupKind, GroupPurchase, GroupStatus, IdempotencyKey,
    Participant, TransitionReason,
};
use crate::pricing;
use crate::repositories::{GroupPurchaseRepository, WalletRepository};
use crate::services::audit::{self, AuditTrailService};
use crate::services::dispatcher::Dispatcher;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Leader checkout of a regular group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<BasketItemRequest>,
    pub expected_friend_count: i32,
    #[serde(default)]
    pub consolidate_shipments: bool,
}

/// Secondary group opened from a failed one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryGroupRequest {
    pub source_group_id: Uuid,
    pub expected_friend_count: i32,
}

/// Price the leader pays up front
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutQuote {
    pub kind: GroupKind,
    pub expected_friend_count: i32,
    pub price: i64,
    /// The same basket bought alone, for display
    pub solo_price: i64,
    pub lines: Vec<BasketLine>,
}

/// Quote plus the gateway charge opened for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub quote: CheckoutQuote,
    pub charge: ChargeSession,
}

/// Service for the group purchase aggregate: creation, joins and cancellation
pub struct GroupService {
    groups: Arc<dyn GroupPurchaseRepository>,
    wallet: Arc<dyn WalletRepository>,
    catalog: Arc<dyn CatalogPriceLookup>,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<GroupLocks>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    audit: Option<Arc<AuditTrailService>>,
    secondary_grace: Duration,
}

impl GroupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        groups: Arc<dyn GroupPurchaseRepository>,
        wallet: Arc<dyn WalletRepository>,
        catalog: Arc<dyn CatalogPriceLookup>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<GroupLocks>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        audit: Option<Arc<AuditTrailService>>,
        secondary_grace: Duration,
    ) -> Self {
        Self {
            groups,
            wallet,
            catalog,
            gateway,
            dispatcher,
            locks,
            clock,
            events,
            audit,
            secondary_grace,
        }
    }

    pub async fn find(&self, group_id: Uuid) -> AppResult<GroupPurchase> {
        self.groups
            .find_group(group_id)
            .await?
            .ok_or(AppError::GroupNotFound(group_id))
    }

    pub async fn basket(&self, group_id: Uuid) -> AppResult<Vec<BasketLine>> {
        Ok(self.groups.find_basket(group_id).await?)
    }

    pub async fn participants(&self, group_id: Uuid) -> AppResult<Vec<Participant>> {
        Ok(self.groups.find_participants(group_id).await?)
    }

    /// Snapshot catalog tiers for the requested items (duplicates are merged)
    async fn snapshot_basket(&self, items: &[BasketItemRequest]) -> AppResult<Vec<BasketLine>> {
        if items.is_empty() {
            return Err(AppError::Validation("basket is empty".to_string()));
        }

        let mut quantities: BTreeMap<&str, i32> = BTreeMap::new();
        for item in items {
            if item.item_id.trim().is_empty() {
                return Err(AppError::Validation("item id must not be empty".to_string()));
            }
            if item.quantity <= 0 {
                return Err(AppError::Validation(format!(
                    "quantity of {} must be positive, got {}",
                    item.item_id, item.quantity
                )));
            }
            let entry = quantities.entry(item.item_id.as_str()).or_insert(0);
            *entry = entry
                .checked_add(item.quantity)
                .ok_or_else(|| AppError::Validation(format!("quantity of {} is too large", item.item_id)))?;
        }

        let mut lines = Vec::with_capacity(quantities.len());
        for (item_id, quantity) in quantities {
            let tier = self.catalog.get_tier_prices(item_id).await?;
            tier.validate()?;
            lines.push(BasketLine::new(Uuid::nil(), item_id, quantity, tier));
        }
        Ok(lines)
    }

    fn quote(lines: Vec<BasketLine>, kind: GroupKind, expected_friend_count: i32) -> AppResult<CheckoutQuote> {
        let price = pricing::checkout_price(&lines, expected_friend_count, kind)?;
        let solo_price = lines.iter().try_fold(0i64, |total, line| {
            line.tier
                .solo_price
                .checked_mul(i64::from(line.quantity))
                .and_then(|line_total| total.checked_add(line_total))
                .ok_or(pricing::PricingError::Overflow)
        })?;

        Ok(CheckoutQuote {
            kind,
            expected_friend_count,
            price,
            solo_price,
            lines,
        })
    }

    pub async fn quote_checkout(&self, request: &CheckoutRequest) -> AppResult<CheckoutQuote> {
        let lines = self.snapshot_basket(&request.items).await?;
        Self::quote(lines, GroupKind::Regular, request.expected_friend_count)
    }

    async fn open_checkout_charge(&self, leader_user_id: Uuid, quote: CheckoutQuote) -> AppResult<CheckoutSession> {
        let request = ChargeRequest {
            payer_user_id: leader_user_id,
            group_id: None,
            amount: quote.price,
            purpose: ChargePurpose::Checkout,
            idempotency_key: format!("checkout:{}:{}", leader_user_id, Uuid::new_v4()),
        };
        let charge = self.gateway.create_charge(&request).await?;

        info!(%leader_user_id, amount = quote.price, reference = %charge.reference, "Checkout charge opened");
        Ok(CheckoutSession { quote, charge })
    }

    pub async fn begin_checkout(&self, leader_user_id: Uuid, request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        let quote = self.quote_checkout(request).await?;
        self.open_checkout_charge(leader_user_id, quote).await
    }

    /// Open a regular group once the leader's checkout charge is confirmed
    pub async fn create(
        &self,
        leader_user_id: Uuid,
        request: &CheckoutRequest,
        payment_reference: &str,
    ) -> AppResult<GroupPurchase> {
        info!(%leader_user_id, expected = request.expected_friend_count, "Creating group purchase");

        let quote = self.quote_checkout(request).await?;
        let paid = self
            .verify_checkout_payment(leader_user_id, payment_reference, quote.price)
            .await?;

        let group = GroupPurchase::new(
            leader_user_id,
            GroupKind::Regular,
            request.expected_friend_count,
            request.consolidate_shipments,
            paid,
            payment_reference.to_string(),
            None,
            self.clock.now(),
        );
        self.insert(group, &quote.lines).await
    }

    /// Confirmed, single-use and covering `price`; an under-payment is refunded
    async fn verify_checkout_payment(&self, leader_user_id: Uuid, reference: &str, price: i64) -> AppResult<i64> {
        if self.groups.find_participant_by_payment(reference).await?.is_some() {
            return Err(AppError::Validation(format!("payment {} was already used", reference)));
        }
        if self
            .wallet
            .find_transaction(&IdempotencyKey::checkout_refund(reference))
            .await?
            .is_some()
        {
            return Err(AppError::Validation(format!("payment {} was refunded", reference)));
        }

        let verification = self.gateway.verify_charge(reference).await?;
        if !verification.is_valid_for(ChargePurpose::Checkout, leader_user_id) {
            return Err(AppError::PaymentNotConfirmed(format!(
                "checkout payment {} is not confirmed",
                reference
            )));
        }

        if verification.amount < price {
            let reason = format!("checkout paid {} but the basket costs {}", verification.amount, price);
            warn!(%leader_user_id, reference, "{}", reason);
            self.dispatcher
                .refund_rejected_checkout(leader_user_id, reference, verification.amount, &reason)
                .await?;
            return Err(AppError::PaymentNotConfirmed(reason));
        }

        Ok(verification.amount)
    }

    async fn insert(&self, group: GroupPurchase, lines: &[BasketLine]) -> AppResult<GroupPurchase> {
        let basket: Vec<BasketLine> = lines.iter().map(|line| line.for_group(group.id)).collect();
        let leader = Participant::leader(
            group.id,
            group.leader_user_id,
            group.original_basket_price,
            &group.leader_payment_reference,
            group.created_at,
        );

        self.groups
            .insert_group(&group, &basket, &leader)
            .await
            .map_err(|e| match e {
                RepositoryError::Duplicate(msg) if group.source_group_id.is_some() => {
                    AppError::SecondaryGroupNotAllowed(msg)
                }
                RepositoryError::Duplicate(_) => AppError::Validation(format!(
                    "payment {} was already used",
                    group.leader_payment_reference
                )),
                other => other.into(),
            })?;

        info!(
            group_id = %group.id,
            kind = group.kind.as_str(),
            price = group.original_basket_price,
            expires_at = %group.expires_at,
            "Group purchase created"
        );

        self.events.publish(DomainEvent::GroupCreated {
            group_id: group.id,
            leader_user_id: group.leader_user_id,
            kind: group.kind,
            expected_friend_count: group.expected_friend_count,
            expires_at: group.expires_at,
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_group_created(&group).await);
        }

        Ok(group)
    }

    /// Failed source group the requester may reopen, with its basket
    async fn secondary_source(
        &self,
        requested_by: Uuid,
        source_group_id: Uuid,
    ) -> AppResult<(GroupPurchase, Vec<BasketLine>)> {
        let source = self.find(source_group_id).await?;
        if source.status != GroupStatus::Failed {
            return Err(AppError::SecondaryGroupNotAllowed(format!(
                "group {} is {}, not failed",
                source.id, source.status
            )));
        }

        let participants = self.participants(source.id).await?;
        let was_member = source.is_leader(requested_by)
            || participants
                .iter()
                .any(|p| p.counts_as_friend() && p.user_id == Some(requested_by));
        if !was_member {
            return Err(AppError::SecondaryGroupNotAllowed(format!(
                "user {} did not take part in group {}",
                requested_by, source.id
            )));
        }

        let closes_at = source.finalized_at.unwrap_or(source.expires_at) + self.secondary_grace;
        if self.clock.now() > closes_at {
            return Err(AppError::SecondaryGroupNotAllowed(format!(
                "the window to reopen group {} closed at {}",
                source.id, closes_at
            )));
        }

        if self.groups.find_secondary_of(source.id, requested_by).await?.is_some() {
            return Err(AppError::SecondaryGroupNotAllowed(format!(
                "group {} was already reopened",
                source.id
            )));
        }

        let basket = self.basket(source.id).await?;
        Ok((source, basket))
    }

    pub async fn quote_secondary(&self, requested_by: Uuid, request: &SecondaryGroupRequest) -> AppResult<CheckoutQuote> {
        let (_, basket) = self.secondary_source(requested_by, request.source_group_id).await?;
        Self::quote(basket, GroupKind::Secondary, request.expected_friend_count)
    }

    pub async fn begin_secondary_checkout(
        &self,
        requested_by: Uuid,
        request: &SecondaryGroupRequest,
    ) -> AppResult<CheckoutSession> {
        let quote = self.quote_secondary(requested_by, request).await?;
        self.open_checkout_charge(requested_by, quote).await
    }

    pub async fn create_secondary(
        &self,
        requested_by: Uuid,
        request: &SecondaryGroupRequest,
        payment_reference: &str,
    ) -> AppResult<GroupPurchase> {
        info!(%requested_by, source = %request.source_group_id, "Creating secondary group");

        let (source, basket) = self.secondary_source(requested_by, request.source_group_id).await?;
        let quote = Self::quote(basket, GroupKind::Secondary, request.expected_friend_count)?;
        let paid = self
            .verify_checkout_payment(requested_by, payment_reference, quote.price)
            .await?;

        let group = GroupPurchase::new(
            requested_by,
            GroupKind::Secondary,
            request.expected_friend_count,
            false,
            paid,
            payment_reference.to_string(),
            Some(source.id),
            self.clock.now(),
        );
        self.insert(group, &quote.lines).await
    }

    /// Record a confirmed friend payment.
    ///
    /// Serialized per group, so the tally a join is priced against is the
    /// tally it is counted in. The participant is recorded at that price;
    /// anything paid above it is the caller's to return. Replaying the same
    /// payment returns the participant it already created.
    pub async fn record_participant_payment(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        amount_paid: i64,
        payment_reference: &str,
        consolidate_with_leader: bool,
    ) -> AppResult<Participant> {
        let guard = self.locks.acquire(group_id).await;

        if let Some(existing) = self.groups.find_participant_by_payment(payment_reference).await? {
            if existing.group_id == group_id && existing.user_id == Some(user_id) && !existing.is_leader {
                return Ok(existing);
            }
            return Err(AppError::PaymentNotConfirmed(format!(
                "payment {} was already used",
                payment_reference
            )));
        }

        let group = self.find(group_id).await?;
        group.ensure_ongoing()?;
        if group.rejects_joins_at(self.clock.now()) {
            return Err(AppError::GroupExpired(group_id));
        }
        if group.is_leader(user_id) {
            return Err(AppError::Validation("the leader cannot join their own group".to_string()));
        }

        let participants = self.participants(group_id).await?;
        if participants.iter().any(|p| p.user_id == Some(user_id)) {
            return Err(AppError::AlreadyJoined { group_id, user_id });
        }

        let basket = self.basket(group_id).await?;
        let confirmed = confirmed_friend_count(&participants);
        let price = pricing::join_price(&basket, confirmed, group.kind)?.ok_or(AppError::GroupFull(group_id))?;
        if amount_paid < price {
            return Err(AppError::Validation(format!(
                "paid {} but joining costs {}",
                amount_paid, price
            )));
        }

        let participant = Participant::paid_friend(
            group_id,
            user_id,
            price,
            payment_reference,
            consolidate_with_leader,
            self.clock.now(),
        );
        self.groups
            .append_paid_participant(&participant)
            .await
            .map_err(|e| match e {
                RepositoryError::Duplicate(_) => AppError::AlreadyJoined { group_id, user_id },
                RepositoryError::BusinessRule(_) => AppError::GroupNotOngoing {
                    group_id,
                    status: group.status,
                },
                other => other.into(),
            })?;
        drop(guard);

        let confirmed = confirmed + 1;
        let next_join_price = pricing::join_price(&basket, confirmed, group.kind)?;
        info!(%group_id, %user_id, amount_paid, price, confirmed, "Friend joined group");

        self.events.publish(DomainEvent::ParticipantJoined {
            group_id,
            user_id,
            confirmed_friend_count: confirmed,
            next_join_price,
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_participant_joined(&participant).await);
        }

        Ok(participant)
    }

    /// Leader withdraws a group nobody has paid into yet
    pub async fn cancel(&self, group_id: Uuid, requested_by: Uuid) -> AppResult<GroupPurchase> {
        let guard = self.locks.acquire(group_id).await;

        let mut group = self.find(group_id).await?;
        auth::require_leader(requested_by, group.leader_user_id, "cancel the group")?;
        group.ensure_ongoing()?;

        let participants = self.participants(group_id).await?;
        let confirmed = confirmed_friend_count(&participants);
        if confirmed > 0 {
            return Err(AppError::Validation(format!(
                "group {} already has {} paid friends",
                group_id, confirmed
            )));
        }

        let transition = group.finalize(TransitionReason::LeaderCancelled, confirmed, self.clock.now())?;
        if !self.groups.commit_transition(&group, &transition, None).await? {
            let current = self.find(group_id).await?;
            return Err(AppError::GroupNotOngoing {
                group_id,
                status: current.status,
            });
        }
        drop(guard);

        info!(%group_id, "Group cancelled by leader");
        self.events.publish(DomainEvent::GroupFinalized {
            group_id,
            leader_user_id: group.leader_user_id,
            status: group.status,
            reason: transition.reason,
            actual_friend_count: confirmed,
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_group_finalized(&group, &transition, None).await);
        }

        Ok(group)
    }
}
