//! Domain events emitted by the engine.
//!
//! Clients learn about joins, finalization and settlement through these
//! events (relayed by the websocket server), not by polling.

use crate::models::{GroupKind, GroupStatus, SettlementMethod, TransitionReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "group.created")]
    GroupCreated {
        group_id: Uuid,
        leader_user_id: Uuid,
        kind: GroupKind,
        expected_friend_count: i32,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "group.participant_joined")]
    ParticipantJoined {
        group_id: Uuid,
        user_id: Uuid,
        confirmed_friend_count: i32,
        /// What the next friend would pay, `None` once the group is full
        next_join_price: Option<i64>,
    },
    #[serde(rename = "group.finalized")]
    GroupFinalized {
        group_id: Uuid,
        leader_user_id: Uuid,
        status: GroupStatus,
        reason: TransitionReason,
        actual_friend_count: i32,
    },
    #[serde(rename = "group.settled")]
    GroupSettled {
        group_id: Uuid,
        leader_user_id: Uuid,
        method: SettlementMethod,
        delta: i64,
    },
    #[serde(rename = "group.join_refunded")]
    JoinRefunded {
        group_id: Uuid,
        user_id: Uuid,
        amount: i64,
        reason: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::GroupCreated { .. } => "group.created",
            DomainEvent::ParticipantJoined { .. } => "group.participant_joined",
            DomainEvent::GroupFinalized { .. } => "group.finalized",
            DomainEvent::GroupSettled { .. } => "group.settled",
            DomainEvent::JoinRefunded { .. } => "group.join_refunded",
        }
    }

    pub fn group_id(&self) -> Uuid {
        match self {
            DomainEvent::GroupCreated { group_id, .. }
            | DomainEvent::ParticipantJoined { group_id, .. }
            | DomainEvent::GroupFinalized { group_id, .. }
            | DomainEvent::GroupSettled { group_id, .. }
            | DomainEvent::JoinRefunded { group_id, .. } => *group_id,
        }
    }

    /// User the event is personally addressed to, if any
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            DomainEvent::GroupCreated { leader_user_id, .. }
            | DomainEvent::GroupFinalized { leader_user_id, .. }
            | DomainEvent::GroupSettled { leader_user_id, .. } => Some(*leader_user_id),
            DomainEvent::ParticipantJoined { user_id, .. } | DomainEvent::JoinRefunded { user_id, .. } => {
                Some(*user_id)
            }
        }
    }

    /// Relay channels: `group:<id>` always, plus `user:<id>` when addressed
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec![format!("group:{}", self.group_id())];
        if let Some(user_id) = self.user_id() {
            channels.push(format!("user:{}", user_id));
        }
        channels
    }
}

/// Fan-out of domain events to any number of in-process listeners
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no listener is not an error
    pub fn publish(&self, event: DomainEvent) -> usize {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(event = name, "No event listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
