use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of a gateway payment submitted when joining a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub reference: String,
    /// Member opts to have their order ship with the leader's
    #[serde(default)]
    pub consolidate_with_leader: bool,
}

/// Participant of a group purchase (leader or invited friend)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub group_id: Uuid,
    /// Unknown until the payment is confirmed
    pub user_id: Option<Uuid>,
    pub is_leader: bool,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub amount_paid: i64,
    pub payment_reference: Option<String>,
    pub consolidate_with_leader: bool,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    /// The leader row written at checkout
    pub fn leader(
        group_id: Uuid,
        user_id: Uuid,
        amount_paid: i64,
        payment_reference: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            user_id: Some(user_id),
            is_leader: true,
            paid: true,
            paid_at: Some(at),
            amount_paid,
            payment_reference: Some(payment_reference.to_string()),
            consolidate_with_leader: false,
            created_at: at,
        }
    }

    /// A friend whose gateway payment has been confirmed
    pub fn paid_friend(
        group_id: Uuid,
        user_id: Uuid,
        amount_paid: i64,
        payment_reference: &str,
        consolidate_with_leader: bool,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            user_id: Some(user_id),
            is_leader: false,
            paid: true,
            paid_at: Some(at),
            amount_paid,
            payment_reference: Some(payment_reference.to_string()),
            consolidate_with_leader,
            created_at: at,
        }
    }

    /// Counts toward the friend tally iff paid and not the leader
    pub fn counts_as_friend(&self) -> bool {
        self.paid && !self.is_leader
    }
}

/// Number of paid, non-leader participants
pub fn confirmed_friend_count(participants: &[Participant]) -> i32 {
    debug_assert!(
        participants.iter().filter(|p| p.is_leader).count() <= 1,
        "a group can have only one leader"
    );

    participants.iter().filter(|p| p.counts_as_friend()).count() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friend_tally_excludes_leader_and_unpaid() {
        let group_id = Uuid::new_v4();
        let now = Utc::now();
        let leader = Participant::leader(group_id, Uuid::new_v4(), 100, "chk", now);
        let friend = Participant::paid_friend(group_id, Uuid::new_v4(), 50, "pay-1", false, now);
        let mut unpaid = Participant::paid_friend(group_id, Uuid::new_v4(), 0, "pay-2", false, now);
        unpaid.paid = false;
        unpaid.user_id = None;

        assert_eq!(confirmed_friend_count(&[leader, friend, unpaid]), 1);
    }

    #[test]
    fn test_empty_roster() {
        assert_eq!(confirmed_friend_count(&[]), 0);
    }
}
