use crate::auth;
use crate::clock::Clock;
use crate::error::{AppError, AppResult, RepositoryError};
use crate::events::{DomainEvent, EventBus};
use crate::locks::GroupLocks;
use crate::models::{
    confirmed_friend_count, GroupPurchase, GroupStatus, SettlementRecord, StatusTransition, TransitionReason,
};
use crate::repositories::{GroupPurchaseRepository, SettlementRepository};
use crate::services::audit::{self, AuditTrailService};
use crate::services::dispatcher::Dispatcher;
use crate::services::settlement::SettlementCalculator;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Commits lost to another writer are retried this many times
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Result of a finalization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationOutcome {
    pub group: GroupPurchase,
    /// Present for successful groups
    pub settlement: Option<SettlementRecord>,
    /// The group had already left the ongoing state before this call
    pub already_finalized: bool,
}

/// Counts from one pass over due groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Leader(Uuid),
    Expiry,
}

pub struct FinalizationService {
    groups: Arc<dyn GroupPurchaseRepository>,
    settlements: Arc<dyn SettlementRepository>,
    calculator: SettlementCalculator,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<GroupLocks>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    audit: Option<Arc<AuditTrailService>>,
}

impl FinalizationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        groups: Arc<dyn GroupPurchaseRepository>,
        settlements: Arc<dyn SettlementRepository>,
        calculator: SettlementCalculator,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<GroupLocks>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        audit: Option<Arc<AuditTrailService>>,
    ) -> Self {
        Self {
            groups,
            settlements,
            calculator,
            dispatcher,
            locks,
            clock,
            events,
            audit,
        }
    }

    pub fn calculator(&self) -> &SettlementCalculator {
        &self.calculator
    }

    /// Leader's "complete now". Past the deadline this behaves like expiry.
    pub async fn finalize_by_leader(&self, group_id: Uuid, requested_by: Uuid) -> AppResult<FinalizationOutcome> {
        self.decide(group_id, Trigger::Leader(requested_by))
            .await?
            .ok_or_else(|| AppError::Message(format!("leader finalization of {} produced no outcome", group_id)))
    }

    /// Finalize a group whose deadline has passed; `None` while it is still open
    pub async fn expire(&self, group_id: Uuid) -> AppResult<Option<FinalizationOutcome>> {
        self.decide(group_id, Trigger::Expiry).await
    }

    async fn decide(&self, group_id: Uuid, trigger: Trigger) -> AppResult<Option<FinalizationOutcome>> {
        let guard = self.locks.acquire(group_id).await;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut group = self
                .groups
                .find_group(group_id)
                .await?
                .ok_or(AppError::GroupNotFound(group_id))?;

            if let Trigger::Leader(user_id) = trigger {
                auth::require_leader(user_id, group.leader_user_id, "finalize the group")?;
            }
            if group.status.is_terminal() {
                return self.existing_outcome(group).await.map(Some);
            }

            let now = self.clock.now();
            let participants = self.groups.find_participants(group_id).await?;
            let friends = confirmed_friend_count(&participants);

            let reason = if group.is_due_for_expiry(now) {
                if friends >= 1 {
                    TransitionReason::ExpiredWithFriends
                } else {
                    TransitionReason::ExpiredWithoutFriends
                }
            } else {
                match trigger {
                    Trigger::Expiry => return Ok(None),
                    Trigger::Leader(_) if friends < 1 => return Err(AppError::InsufficientFriends(group_id)),
                    Trigger::Leader(_) => TransitionReason::LeaderCompleted,
                }
            };

            let transition = group.finalize(reason, friends, now)?;
            let settlement = if group.status == GroupStatus::Success {
                let basket = self.groups.find_basket(group_id).await?;
                Some(self.calculator.compute(&group, &basket, &participants, None, now)?)
            } else {
                None
            };
            debug_assert!(settlement.is_none() || group.status == GroupStatus::Success);

            match self.groups.commit_transition(&group, &transition, settlement.as_ref()).await {
                Ok(true) => {
                    drop(guard);
                    return self.committed(group, transition, settlement).await.map(Some);
                }
                Ok(false) => debug!(%group_id, attempt, "Group was finalized by another writer"),
                Err(RepositoryError::Conflict(msg)) => {
                    warn!(%group_id, attempt, "Friend tally moved during finalization: {}", msg)
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::Message(format!(
            "finalization of group {} kept conflicting with concurrent writers",
            group_id
        )))
    }

    async fn existing_outcome(&self, group: GroupPurchase) -> AppResult<FinalizationOutcome> {
        let settlement = self.settlements.find_settlement(group.id).await?;
        Ok(FinalizationOutcome {
            group,
            settlement,
            already_finalized: true,
        })
    }

    async fn committed(
        &self,
        group: GroupPurchase,
        transition: StatusTransition,
        mut settlement: Option<SettlementRecord>,
    ) -> AppResult<FinalizationOutcome> {
        info!(
            group_id = %group.id,
            status = group.status.as_str(),
            reason = transition.reason.as_str(),
            friends = group.actual_friend_count,
            delta = settlement.as_ref().map(|s| s.delta),
            "Group finalized"
        );

        self.events.publish(DomainEvent::GroupFinalized {
            group_id: group.id,
            leader_user_id: group.leader_user_id,
            status: group.status,
            reason: transition.reason,
            actual_friend_count: group.actual_friend_count.unwrap_or(0),
        });
        if let Some(trail) = &self.audit {
            audit::report(trail.log_group_finalized(&group, &transition, settlement.as_ref()).await);
        }

        // Nothing to pay either way: close it now
        if settlement.as_ref().map_or(false, |s| s.delta == 0) {
            match self.dispatcher.dispatch(group.id).await {
                Ok(settled) => settlement = Some(settled),
                Err(e) => warn!(group_id = %group.id, error = %e, "Zero-delta settlement left open"),
            }
        }

        Ok(FinalizationOutcome {
            group,
            settlement,
            already_finalized: false,
        })
    }

    /// Finalize every group whose deadline has passed, concurrently
    pub async fn expire_due(&self, limit: i64) -> AppResult<SweepReport> {
        let now = self.clock.now();
        let due = self.groups.find_expired_ongoing(now, limit).await?;

        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            self.prune_locks();
            return Ok(report);
        }

        let results = join_all(due.iter().map(|group_id| self.expire(*group_id))).await;
        for (group_id, result) in due.iter().zip(results) {
            match result {
                Ok(Some(outcome)) if outcome.already_finalized => report.skipped += 1,
                Ok(Some(outcome)) => match outcome.group.status {
                    GroupStatus::Success => report.succeeded += 1,
                    _ => report.failed += 1,
                },
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(%group_id, error = %e, "Failed to expire group");
                    report.errors += 1;
                }
            }
        }

        self.prune_locks();
        Ok(report)
    }

    /// Locks of groups nobody is waiting on are dropped on every sweep
    fn prune_locks(&self) {
        let pruned = self.locks.prune();
        if pruned > 0 {
            debug!(pruned, "Pruned idle group locks");
        }
    }
}
