use crate::error::{AppError, AppResult};
use crate::models::{
    BasketLine, GroupKind, GroupPurchase, GroupStatus, Participant, SettlementMethod, SettlementRecord,
};
use crate::pricing::{self, PricingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the "if N friends join" table shown to a leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedSettlement {
    pub friend_count: i32,
    pub final_basket_price: i64,
    /// Before any consolidation discount
    pub delta: i64,
}

/// Computes the reconciliation between what the leader paid at checkout and
/// what the basket costs at the final friend count
#[derive(Debug, Clone, Copy)]
pub struct SettlementCalculator {
    consolidation_discount: i64,
}

impl SettlementCalculator {
    pub fn new(consolidation_discount: i64) -> Self {
        Self {
            consolidation_discount: consolidation_discount.max(0),
        }
    }

    pub fn consolidation_discount(&self) -> i64 {
        self.consolidation_discount
    }

    /// Build the settlement of a successful group.
    ///
    /// An already-computed record is returned unchanged, so finalization can
    /// be replayed without moving any amount.
    pub fn compute(
        &self,
        group: &GroupPurchase,
        basket: &[BasketLine],
        participants: &[Participant],
        existing: Option<&SettlementRecord>,
        at: DateTime<Utc>,
    ) -> AppResult<SettlementRecord> {
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }

        if group.status != GroupStatus::Success {
            return Err(AppError::Message(format!(
                "settlement requested for group {} in status {}",
                group.id, group.status
            )));
        }

        let actual = group
            .actual_friend_count
            .unwrap_or_else(|| crate::models::confirmed_friend_count(participants));

        let final_basket_price = pricing::basket_price(basket, actual, group.kind)?;
        let consolidation_discount = self.discount_for(group, participants);

        let delta = final_basket_price
            .checked_sub(group.original_basket_price)
            .and_then(|d| d.checked_sub(consolidation_discount))
            .ok_or(PricingError::Overflow)?;

        Ok(SettlementRecord {
            group_id: group.id,
            leader_user_id: group.leader_user_id,
            kind: group.kind,
            expected_friend_count: group.expected_friend_count,
            actual_friend_count: actual,
            original_basket_price: group.original_basket_price,
            final_basket_price,
            consolidation_discount,
            delta,
            method: SettlementMethod::None,
            wallet_applied: 0,
            pending_operation: None,
            gateway_reference: None,
            gateway_amount: None,
            payment_url: None,
            settled_at: None,
            created_at: at,
            version: 0,
        })
    }

    /// Regular groups only: the leader consolidated and at least one paid
    /// friend opted to ship with them
    fn discount_for(&self, group: &GroupPurchase, participants: &[Participant]) -> i64 {
        let applies = group.kind == GroupKind::Regular
            && group.consolidate_shipments
            && participants
                .iter()
                .any(|p| p.counts_as_friend() && p.consolidate_with_leader);

        if applies {
            self.consolidation_discount
        } else {
            0
        }
    }

    /// Delta the leader would see for every reachable friend count
    pub fn project(&self, group: &GroupPurchase, basket: &[BasketLine]) -> AppResult<Vec<ProjectedSettlement>> {
        (0..=group.friend_cap())
            .map(|friend_count| {
                let final_basket_price = pricing::basket_price(basket, friend_count, group.kind)?;
                let delta = final_basket_price
                    .checked_sub(group.original_basket_price)
                    .ok_or(PricingError::Overflow)?;
                Ok(ProjectedSettlement {
                    friend_count,
                    final_basket_price,
                    delta,
                })
            })
            .collect()
    }
}
