use crate::clock::Clock;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::gateway::{ChargePurpose, ChargeRequest, ChargeSession, PaymentGateway};
use crate::models::{confirmed_friend_count, GroupKind, IdempotencyKey, Participant, PaymentProof};
use crate::pricing;
use crate::repositories::WalletRepository;
use crate::services::dispatcher::Dispatcher;
use crate::services::group_service::GroupService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the next friend owes right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinQuote {
    pub group_id: Uuid,
    pub kind: GroupKind,
    pub confirmed_friend_count: i32,
    pub friend_cap: i32,
    /// `None` once the group is full
    pub price: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub joinable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSession {
    pub quote: JoinQuote,
    pub charge: ChargeSession,
}

/// Rejections after which a confirmed payment goes back to the payer
fn is_refundable(err: &AppError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::GroupExpired
            | ErrorKind::GroupNotOngoing
            | ErrorKind::GroupFull
            | ErrorKind::AlreadyJoined
            | ErrorKind::Validation
    )
}

pub struct JoinService {
    groups: Arc<GroupService>,
    dispatcher: Arc<Dispatcher>,
    gateway: Arc<dyn PaymentGateway>,
    wallet: Arc<dyn WalletRepository>,
    clock: Arc<dyn Clock>,
}

impl JoinService {
    pub fn new(
        groups: Arc<GroupService>,
        dispatcher: Arc<Dispatcher>,
        gateway: Arc<dyn PaymentGateway>,
        wallet: Arc<dyn WalletRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            groups,
            dispatcher,
            gateway,
            wallet,
            clock,
        }
    }

    pub async fn quote_join(&self, group_id: Uuid) -> AppResult<JoinQuote> {
        let group = self.groups.find(group_id).await?;
        let participants = self.groups.participants(group_id).await?;
        let basket = self.groups.basket(group_id).await?;

        let confirmed = confirmed_friend_count(&participants);
        let price = pricing::join_price(&basket, confirmed, group.kind)?;
        let joinable = group.is_ongoing() && !group.rejects_joins_at(self.clock.now()) && price.is_some();

        Ok(JoinQuote {
            group_id,
            kind: group.kind,
            confirmed_friend_count: confirmed,
            friend_cap: group.friend_cap(),
            price,
            expires_at: group.expires_at,
            joinable,
        })
    }

    /// Open the gateway charge a friend pays to join
    pub async fn begin_join(&self, user_id: Uuid, group_id: Uuid) -> AppResult<JoinSession> {
        let group = self.groups.find(group_id).await?;
        group.ensure_ongoing()?;
        if group.rejects_joins_at(self.clock.now()) {
            return Err(AppError::GroupExpired(group_id));
        }
        if group.is_leader(user_id) {
            return Err(AppError::Validation("the leader cannot join their own group".to_string()));
        }
        let participants = self.groups.participants(group_id).await?;
        if participants.iter().any(|p| p.user_id == Some(user_id)) {
            return Err(AppError::AlreadyJoined { group_id, user_id });
        }

        let quote = self.quote_join(group_id).await?;
        let amount = quote.price.ok_or(AppError::GroupFull(group_id))?;

        let request = ChargeRequest {
            payer_user_id: user_id,
            group_id: Some(group_id),
            amount,
            purpose: ChargePurpose::Join,
            idempotency_key: format!("join:{}:{}:{}", group_id, user_id, Uuid::new_v4()),
        };
        let charge = self.gateway.create_charge(&request).await?;

        info!(%group_id, %user_id, amount, reference = %charge.reference, "Join charge opened");
        Ok(JoinSession { quote, charge })
    }

    /// Verify a friend's payment and count it toward the group.
    ///
    /// Verification happens before the group lock is taken. A confirmed
    /// payment the group cannot accept is credited back to the payer's wallet
    /// and the rejection is returned. A payment above the price the join was
    /// counted at has the difference credited to the wallet once the lock is
    /// released; replaying the join retries a credit that failed.
    pub async fn join(&self, user_id: Uuid, group_id: Uuid, proof: &PaymentProof) -> AppResult<Participant> {
        let reference = proof.reference.trim();
        if reference.is_empty() {
            return Err(AppError::Validation("payment reference is required".to_string()));
        }

        if self
            .wallet
            .find_transaction(&IdempotencyKey::join_refund(reference))
            .await?
            .is_some()
        {
            return Err(AppError::PaymentNotConfirmed(format!("payment {} was refunded", reference)));
        }

        let verification = self.gateway.verify_charge(reference).await?;
        if !verification.is_valid_for(ChargePurpose::Join, user_id) {
            return Err(AppError::PaymentNotConfirmed(format!("join payment {} is not confirmed", reference)));
        }
        // Left unspent, so it can still join the group it was opened for
        if !verification.is_for_group(group_id) {
            return Err(AppError::PaymentNotConfirmed(format!(
                "join payment {} was opened for another group",
                reference
            )));
        }

        let result = self
            .groups
            .record_participant_payment(
                group_id,
                user_id,
                verification.amount,
                reference,
                proof.consolidate_with_leader,
            )
            .await;

        match result {
            Ok(participant) => {
                let surplus = verification.amount - participant.amount_paid;
                if surplus > 0 {
                    info!(%group_id, %user_id, reference, surplus, "Join paid above its price, crediting surplus");
                    self.dispatcher
                        .refund_join_overpayment(group_id, user_id, reference, surplus)
                        .await
                        .map_err(|e| {
                            error!(%group_id, %user_id, reference, error = %e, "Join surplus credit failed");
                            e
                        })?;
                }
                Ok(participant)
            }
            Err(rejection) if is_refundable(&rejection) => {
                warn!(%group_id, %user_id, reference, error = %rejection, "Paid join rejected, refunding");
                let reason = rejection.kind().as_str();
                if let Err(refund_err) = self
                    .dispatcher
                    .refund_rejected_join(group_id, user_id, reference, verification.amount, reason)
                    .await
                {
                    error!(%group_id, %user_id, reference, error = %refund_err, "Join refund failed");
                    return Err(refund_err);
                }
                Err(rejection)
            }
            other => other,
        }
    }
}
