use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed lifetime of every group, measured from creation
pub const GROUP_WINDOW_HOURS: i64 = 24;

/// Group kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Regular,
    Secondary,
}

impl GroupKind {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "regular" => Ok(GroupKind::Regular),
            "secondary" => Ok(GroupKind::Secondary),
            _ => Err(format!("Invalid group kind: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Regular => "regular",
            GroupKind::Secondary => "secondary",
        }
    }

    /// Number of paid friends at which the basket becomes free
    pub fn friend_cap(&self) -> i32 {
        match self {
            GroupKind::Regular => 3,
            GroupKind::Secondary => 4,
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Ongoing,
    Success,
    Failed,
}

impl GroupStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "ongoing" => Ok(GroupStatus::Ongoing),
            "success" => Ok(GroupStatus::Success),
            "failed" => Ok(GroupStatus::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Ongoing => "ongoing",
            GroupStatus::Success => "success",
            GroupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GroupStatus::Ongoing)
    }

    /// The only legal moves are ongoing→success and ongoing→failed.
    pub fn transition(self, next: GroupStatus) -> Result<GroupStatus, (GroupStatus, GroupStatus)> {
        match (self, next) {
            (GroupStatus::Ongoing, GroupStatus::Success) | (GroupStatus::Ongoing, GroupStatus::Failed) => Ok(next),
            (GroupStatus::Ongoing, GroupStatus::Ongoing)
            | (GroupStatus::Success, _)
            | (GroupStatus::Failed, _) => Err((self, next)),
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a group left the ongoing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    LeaderCompleted,
    ExpiredWithFriends,
    ExpiredWithoutFriends,
    LeaderCancelled,
}

impl TransitionReason {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "leader_completed" => Ok(TransitionReason::LeaderCompleted),
            "expired_with_friends" => Ok(TransitionReason::ExpiredWithFriends),
            "expired_without_friends" => Ok(TransitionReason::ExpiredWithoutFriends),
            "leader_cancelled" => Ok(TransitionReason::LeaderCancelled),
            _ => Err(format!("Invalid transition reason: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::LeaderCompleted => "leader_completed",
            TransitionReason::ExpiredWithFriends => "expired_with_friends",
            TransitionReason::ExpiredWithoutFriends => "expired_without_friends",
            TransitionReason::LeaderCancelled => "leader_cancelled",
        }
    }

    /// Terminal status this reason leads to
    pub fn target_status(&self) -> GroupStatus {
        match self {
            TransitionReason::LeaderCompleted | TransitionReason::ExpiredWithFriends => GroupStatus::Success,
            TransitionReason::ExpiredWithoutFriends | TransitionReason::LeaderCancelled => GroupStatus::Failed,
        }
    }
}

/// Append-only log entry for a status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub group_id: Uuid,
    pub from: GroupStatus,
    pub to: GroupStatus,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Group purchase aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPurchase {
    pub id: Uuid,
    pub leader_user_id: Uuid,
    pub kind: GroupKind,
    pub status: GroupStatus,
    pub expected_friend_count: i32,
    /// Frozen when the group leaves the ongoing state
    pub actual_friend_count: Option<i32>,
    /// Leader asked for invited members' orders to ship with theirs
    pub consolidate_shipments: bool,
    /// What the leader paid at checkout, stored verbatim
    pub original_basket_price: i64,
    pub leader_payment_reference: String,
    /// Failed group this secondary group was opened from
    pub source_group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl GroupPurchase {
    /// Create a new ongoing group; `expires_at` is derived from `created_at`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        leader_user_id: Uuid,
        kind: GroupKind,
        expected_friend_count: i32,
        consolidate_shipments: bool,
        original_basket_price: i64,
        leader_payment_reference: String,
        source_group_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            leader_user_id,
            kind,
            status: GroupStatus::Ongoing,
            expected_friend_count,
            actual_friend_count: None,
            consolidate_shipments,
            original_basket_price,
            leader_payment_reference,
            source_group_id,
            created_at,
            expires_at: created_at + Self::window(),
            finalized_at: None,
        }
    }

    pub fn window() -> Duration {
        Duration::hours(GROUP_WINDOW_HOURS)
    }

    pub fn friend_cap(&self) -> i32 {
        self.kind.friend_cap()
    }

    pub fn is_leader(&self, user_id: Uuid) -> bool {
        self.leader_user_id == user_id
    }

    pub fn is_ongoing(&self) -> bool {
        self.status == GroupStatus::Ongoing
    }

    /// Joins are rejected strictly after the deadline
    pub fn rejects_joins_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The sweeper finalizes from the deadline instant onward
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.is_ongoing() && now >= self.expires_at
    }

    pub fn ensure_ongoing(&self) -> AppResult<()> {
        if self.is_ongoing() {
            Ok(())
        } else {
            Err(AppError::GroupNotOngoing {
                group_id: self.id,
                status: self.status,
            })
        }
    }

    /// Apply a terminal transition, freezing the friend count.
    pub fn finalize(
        &mut self,
        reason: TransitionReason,
        friend_count: i32,
        at: DateTime<Utc>,
    ) -> AppResult<StatusTransition> {
        let next = self
            .status
            .transition(reason.target_status())
            .map_err(|(current, _)| AppError::GroupNotOngoing {
                group_id: self.id,
                status: current,
            })?;

        let transition = StatusTransition {
            group_id: self.id,
            from: self.status,
            to: next,
            reason,
            at,
        };

        self.status = next;
        self.actual_friend_count = Some(friend_count);
        self.finalized_at = Some(at);

        Ok(transition)
    }
}
