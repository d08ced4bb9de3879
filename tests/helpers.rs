#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use group_buy_engine::catalog::StaticCatalog;
use group_buy_engine::clock::ManualClock;
use group_buy_engine::config::EngineConfig;
use group_buy_engine::gateway::SimulatedGateway;
use group_buy_engine::locks::GroupLocks;
use group_buy_engine::models::*;
use group_buy_engine::repositories::InMemoryStore;
use group_buy_engine::services::CheckoutRequest;
use group_buy_engine::{AppResult, EventBus, GroupPurchaseEngine, Session, Stores};
use std::sync::Arc;
use uuid::Uuid;

/// Item with every tier set: 300k alone, 200k with one friend, 100k with two
pub const TEE: &str = "tee";
/// Item priced only by its solo price
pub const LAMP: &str = "lamp";

pub const CONSOLIDATION_DISCOUNT: i64 = 20_000;

/// Engine on in-memory storage with a clock and gateway the test controls
pub struct TestEngine {
    pub engine: Arc<GroupPurchaseEngine>,
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<SimulatedGateway>,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    pub locks: Arc<GroupLocks>,
}

impl TestEngine {
    /// Every charge is captured as soon as it is opened
    pub fn new() -> Self {
        Self::with_gateway(SimulatedGateway::auto_confirming())
    }

    /// Charges stay pending until the test pays them
    pub fn manual_payments() -> Self {
        Self::with_gateway(SimulatedGateway::new())
    }

    pub fn with_gateway(gateway: SimulatedGateway) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(gateway);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let events = EventBus::new(256);
        let locks = Arc::new(GroupLocks::new());

        let catalog = StaticCatalog::new()
            .with_item(TEE, PricingTier::new(300_000, Some(200_000), Some(100_000), Some(0)).unwrap())
            .with_item(LAMP, PricingTier::solo_only(1_000_000).unwrap());

        let config = EngineConfig {
            consolidation_discount: CONSOLIDATION_DISCOUNT,
            sweep_batch_size: 10,
            ..EngineConfig::default()
        };

        let engine = GroupPurchaseEngine::builder(Stores::in_memory(store.clone()), Arc::new(catalog), gateway.clone())
            .clock(clock.clone())
            .events(events.clone())
            .locks(locks.clone())
            .config(config)
            .build();

        Self {
            engine: Arc::new(engine),
            store,
            gateway,
            clock,
            events,
            locks,
        }
    }

    /// Pay for a checkout and open the group
    pub async fn open_group(&self, leader: Uuid, request: &CheckoutRequest) -> GroupPurchase {
        let session = self
            .engine
            .begin_checkout(&Session::authenticated(leader), request)
            .await
            .expect("Failed to begin checkout");
        self.gateway.pay(&session.charge.reference);

        self.engine
            .create_group(&Session::authenticated(leader), request, &session.charge.reference)
            .await
            .expect("Failed to create group")
    }

    /// Pay the current join price and join
    pub async fn join(&self, user: Uuid, group_id: Uuid) -> AppResult<Participant> {
        self.join_with(user, group_id, false).await
    }

    pub async fn join_with(&self, user: Uuid, group_id: Uuid, consolidate: bool) -> AppResult<Participant> {
        let session = self.engine.begin_join(&Session::authenticated(user), group_id).await?;
        self.gateway.pay(&session.charge.reference);

        let proof = PaymentProof {
            reference: session.charge.reference,
            consolidate_with_leader: consolidate,
        };
        self.engine
            .join_group(&Session::authenticated(user), group_id, &proof)
            .await
    }

    /// Open a group and have `friends` users join it
    pub async fn group_with_friends(&self, request: &CheckoutRequest, friends: usize) -> (Uuid, GroupPurchase) {
        let leader = Uuid::new_v4();
        let group = self.open_group(leader, request).await;
        for _ in 0..friends {
            self.join(Uuid::new_v4(), group.id).await.expect("Failed to join group");
        }
        (leader, group)
    }

    pub fn expire_window(&self) {
        self.clock.advance(GroupPurchase::window());
    }
}

pub fn checkout(item: &str, quantity: i32, expected_friend_count: i32) -> CheckoutRequest {
    CheckoutRequest {
        items: vec![BasketItemRequest {
            item_id: item.to_string(),
            quantity,
        }],
        expected_friend_count,
        consolidate_shipments: false,
    }
}

pub fn consolidated_checkout(item: &str, quantity: i32, expected_friend_count: i32) -> CheckoutRequest {
    CheckoutRequest {
        consolidate_shipments: true,
        ..checkout(item, quantity, expected_friend_count)
    }
}

pub fn as_user(user: Uuid) -> Session {
    Session::authenticated(user)
}

/// Luhn-valid test card
pub const VALID_CARD: &str = "4111 1111 1111 1111";
