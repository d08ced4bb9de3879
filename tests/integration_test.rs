mod helpers;

use group_buy_engine::error::AppError;
use group_buy_engine::models::*;
use group_buy_engine::repositories::PayoutRepository;
use group_buy_engine::services::{AuditTrailService, SecondaryGroupRequest};
use group_buy_engine::{DomainEvent, GroupPurchaseEngine, Session, Stores};
use helpers::*;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

// ============================================================================
// Checkout
// ============================================================================

#[tokio::test]
async fn test_checkout_opens_group() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let request = checkout(TEE, 1, 2);

    let quote = t.engine.quote_checkout(&request).await.unwrap();
    assert_eq!(quote.price, 200_000);
    assert_eq!(quote.solo_price, 300_000);

    let group = t.open_group(leader, &request).await;
    assert_eq!(group.status, GroupStatus::Ongoing);
    assert_eq!(group.kind, GroupKind::Regular);
    assert_eq!(group.original_basket_price, 200_000);
    assert_eq!(group.expires_at - group.created_at, GroupPurchase::window());

    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.participants.len(), 1);
    assert!(view.participants[0].is_leader);
    assert_eq!(view.confirmed_friend_count, 0);
    assert_eq!(view.join_price, Some(200_000));
    assert_eq!(view.projection.len(), 4);
    assert!(view.settlement.is_none());
}

#[tokio::test]
async fn test_duplicate_items_are_merged() {
    let t = TestEngine::new();
    let request = group_buy_engine::services::CheckoutRequest {
        items: vec![
            BasketItemRequest {
                item_id: TEE.to_string(),
                quantity: 1,
            },
            BasketItemRequest {
                item_id: TEE.to_string(),
                quantity: 2,
            },
        ],
        expected_friend_count: 3,
        consolidate_shipments: false,
    };

    let quote = t.engine.quote_checkout(&request).await.unwrap();
    assert_eq!(quote.lines.len(), 1);
    assert_eq!(quote.lines[0].quantity, 3);
    assert_eq!(quote.price, 300_000);
}

#[tokio::test]
async fn test_checkout_validation() {
    let t = TestEngine::new();

    let anonymous = t.engine.begin_checkout(&Session::anonymous(), &checkout(TEE, 1, 2)).await;
    assert!(matches!(anonymous, Err(AppError::Unauthenticated)));

    let unknown = t.engine.quote_checkout(&checkout("missing", 1, 2)).await;
    assert!(matches!(unknown, Err(AppError::NotFound(_))));

    let zero = t.engine.quote_checkout(&checkout(TEE, 0, 2)).await;
    assert!(matches!(zero, Err(AppError::Validation(_))));

    let too_many = t.engine.quote_checkout(&checkout(TEE, 1, 4)).await;
    assert!(matches!(too_many, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_checkout_requires_confirmed_payment() {
    let t = TestEngine::manual_payments();
    let leader = Uuid::new_v4();
    let request = checkout(TEE, 1, 2);

    let session = t.engine.begin_checkout(&as_user(leader), &request).await.unwrap();
    let unpaid = t
        .engine
        .create_group(&as_user(leader), &request, &session.charge.reference)
        .await;
    assert!(matches!(unpaid, Err(AppError::PaymentNotConfirmed(_))));

    t.gateway.pay(&session.charge.reference);
    assert_ok!(
        t.engine
            .create_group(&as_user(leader), &request, &session.charge.reference)
            .await
    );
}

#[tokio::test]
async fn test_checkout_reference_is_single_use() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let request = checkout(TEE, 1, 2);
    let group = t.open_group(leader, &request).await;

    let reused = t
        .engine
        .create_group(&as_user(leader), &request, &group.leader_payment_reference)
        .await;
    assert!(matches!(reused, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_checkout_underpayment_is_refunded() {
    let t = TestEngine::manual_payments();
    let leader = Uuid::new_v4();
    let request = checkout(TEE, 1, 2);
    t.gateway.record_paid("chk-short", 150_000);

    let result = t.engine.create_group(&as_user(leader), &request, "chk-short").await;
    assert!(matches!(result, Err(AppError::PaymentNotConfirmed(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 150_000);

    let transactions = t.engine.wallet_transactions(&as_user(leader)).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].kind, WalletTransactionType::CheckoutRefund);

    // The refunded payment cannot open a group later
    let retry = t.engine.create_group(&as_user(leader), &request, "chk-short").await;
    assert!(matches!(retry, Err(AppError::Validation(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 150_000);
}

// ============================================================================
// Joining
// ============================================================================

#[tokio::test]
async fn test_join_price_follows_tally() {
    let t = TestEngine::new();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 3)).await;

    let mut paid = Vec::new();
    for _ in 0..3 {
        let quote = t.engine.quote_join(group.id).await.unwrap();
        assert!(quote.joinable);
        let participant = t.join(Uuid::new_v4(), group.id).await.unwrap();
        assert_eq!(Some(participant.amount_paid), quote.price);
        paid.push(participant.amount_paid);
    }
    assert_eq!(paid, vec![200_000, 200_000, 100_000]);

    let quote = t.engine.quote_join(group.id).await.unwrap();
    assert_eq!(quote.confirmed_friend_count, 3);
    assert_eq!(quote.price, None);
    assert!(!quote.joinable);

    let full = t.engine.begin_join(&as_user(Uuid::new_v4()), group.id).await;
    assert!(matches!(full, Err(AppError::GroupFull(_))));
}

#[tokio::test]
async fn test_leader_cannot_join_own_group() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &checkout(TEE, 1, 2)).await;

    let result = t.engine.begin_join(&as_user(leader), group.id).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_join_replay_returns_same_participant() {
    let t = TestEngine::new();
    let friend = Uuid::new_v4();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;

    let session = t.engine.begin_join(&as_user(friend), group.id).await.unwrap();
    let proof = PaymentProof {
        reference: session.charge.reference.clone(),
        consolidate_with_leader: false,
    };

    let first = t.engine.join_group(&as_user(friend), group.id, &proof).await.unwrap();
    let second = t.engine.join_group(&as_user(friend), group.id, &proof).await.unwrap();
    assert_eq!(first.id, second.id);

    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.confirmed_friend_count, 1);
}

#[tokio::test]
async fn test_join_with_someone_elses_payment_is_rejected() {
    let t = TestEngine::new();
    let owner = Uuid::new_v4();
    let thief = Uuid::new_v4();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;

    let session = t.engine.begin_join(&as_user(owner), group.id).await.unwrap();
    let proof = PaymentProof {
        reference: session.charge.reference,
        consolidate_with_leader: false,
    };

    let result = t.engine.join_group(&as_user(thief), group.id, &proof).await;
    assert!(matches!(result, Err(AppError::PaymentNotConfirmed(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(thief)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_second_payment_of_joined_user_is_refunded() {
    let t = TestEngine::new();
    let friend = Uuid::new_v4();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;

    let first = t.engine.begin_join(&as_user(friend), group.id).await.unwrap();
    let second = t.engine.begin_join(&as_user(friend), group.id).await.unwrap();
    assert_ne!(first.charge.reference, second.charge.reference);

    let proof = |reference: &str| PaymentProof {
        reference: reference.to_string(),
        consolidate_with_leader: false,
    };
    assert_ok!(
        t.engine
            .join_group(&as_user(friend), group.id, &proof(&first.charge.reference))
            .await
    );

    let duplicate = t
        .engine
        .join_group(&as_user(friend), group.id, &proof(&second.charge.reference))
        .await;
    assert!(matches!(duplicate, Err(AppError::AlreadyJoined { .. })));
    assert_eq!(t.engine.wallet_balance(&as_user(friend)).await.unwrap(), 200_000);

    // A refunded payment is spent
    let replay = t
        .engine
        .join_group(&as_user(friend), group.id, &proof(&second.charge.reference))
        .await;
    assert!(matches!(replay, Err(AppError::PaymentNotConfirmed(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(friend)).await.unwrap(), 200_000);
}

#[tokio::test]
async fn test_underpaid_join_is_refunded() {
    let t = TestEngine::manual_payments();
    let friend = Uuid::new_v4();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;
    let mut events = t.events.subscribe();
    t.gateway.record_paid("join-short", 50_000);

    let proof = PaymentProof {
        reference: "join-short".to_string(),
        consolidate_with_leader: false,
    };
    let result = t.engine.join_group(&as_user(friend), group.id, &proof).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(friend)).await.unwrap(), 50_000);

    match events.try_recv() {
        Ok(DomainEvent::JoinRefunded { user_id, amount, .. }) => {
            assert_eq!(user_id, friend);
            assert_eq!(amount, 50_000);
        }
        other => panic!("expected a join refund event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_join_paid_at_stale_quote_credits_difference() {
    let t = TestEngine::new();
    let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 3), 1).await;

    // Both quoted while one friend is confirmed
    let session_x = t.engine.begin_join(&as_user(x), group.id).await.unwrap();
    let session_y = t.engine.begin_join(&as_user(y), group.id).await.unwrap();
    assert_eq!(session_x.quote.price, Some(200_000));
    assert_eq!(session_y.quote.price, Some(200_000));

    let proof = |reference: &str| PaymentProof {
        reference: reference.to_string(),
        consolidate_with_leader: false,
    };
    let joined_x = t
        .engine
        .join_group(&as_user(x), group.id, &proof(&session_x.charge.reference))
        .await
        .unwrap();
    assert_eq!(joined_x.amount_paid, 200_000);
    assert_eq!(t.engine.quote_join(group.id).await.unwrap().price, Some(100_000));

    let joined_y = t
        .engine
        .join_group(&as_user(y), group.id, &proof(&session_y.charge.reference))
        .await
        .unwrap();
    assert_eq!(joined_y.amount_paid, 100_000);
    assert_eq!(t.engine.wallet_balance(&as_user(y)).await.unwrap(), 100_000);
    assert_eq!(t.engine.wallet_balance(&as_user(x)).await.unwrap(), 0);

    let credits = t.engine.wallet_transactions(&as_user(y)).await.unwrap();
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].kind, WalletTransactionType::JoinOverpayRefund);
    assert_eq!(
        credits[0].idempotency_key,
        format!("join-overpay:{}", session_y.charge.reference)
    );

    // Replaying the join does not credit the difference twice
    let replay = t
        .engine
        .join_group(&as_user(y), group.id, &proof(&session_y.charge.reference))
        .await
        .unwrap();
    assert_eq!(replay.id, joined_y.id);
    assert_eq!(t.engine.wallet_balance(&as_user(y)).await.unwrap(), 100_000);

    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.confirmed_friend_count, 3);
    let paid: Vec<i64> = view
        .participants
        .iter()
        .filter(|p| !p.is_leader)
        .map(|p| p.amount_paid)
        .collect();
    assert_eq!(paid.iter().sum::<i64>(), 500_000);

    assert_ok!(t.engine.finalize_group(&as_user(leader), group.id).await);
}

#[tokio::test]
async fn test_join_payment_is_bound_to_its_group() {
    let t = TestEngine::new();
    let friend = Uuid::new_v4();
    let first = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;
    let second = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;

    let session = t.engine.begin_join(&as_user(friend), first.id).await.unwrap();
    let proof = PaymentProof {
        reference: session.charge.reference,
        consolidate_with_leader: false,
    };

    let result = t.engine.join_group(&as_user(friend), second.id, &proof).await;
    assert!(matches!(result, Err(AppError::PaymentNotConfirmed(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(friend)).await.unwrap(), 0);
    assert_eq!(t.engine.get_group(second.id).await.unwrap().confirmed_friend_count, 0);

    // Still good for the group it was opened for
    let joined = t.engine.join_group(&as_user(friend), first.id, &proof).await.unwrap();
    assert_eq!(joined.group_id, first.id);
    assert_eq!(joined.amount_paid, 200_000);
}

#[tokio::test]
async fn test_join_after_finalization_is_refunded() {
    let t = TestEngine::new();
    let late = Uuid::new_v4();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 1).await;

    let session = t.engine.begin_join(&as_user(late), group.id).await.unwrap();
    assert_ok!(t.engine.finalize_group(&as_user(leader), group.id).await);

    let proof = PaymentProof {
        reference: session.charge.reference,
        consolidate_with_leader: false,
    };
    let result = t.engine.join_group(&as_user(late), group.id, &proof).await;
    assert!(matches!(result, Err(AppError::GroupNotOngoing { .. })));
    assert_eq!(t.engine.wallet_balance(&as_user(late)).await.unwrap(), 200_000);

    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.group.actual_friend_count, Some(1));
}

#[tokio::test]
async fn test_join_after_deadline_expires_group() {
    let t = TestEngine::new();
    let friend = Uuid::new_v4();
    let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;

    let session = t.engine.begin_join(&as_user(friend), group.id).await.unwrap();
    t.expire_window();
    t.clock.advance(chrono::Duration::seconds(1));

    let proof = PaymentProof {
        reference: session.charge.reference,
        consolidate_with_leader: false,
    };
    let result = t.engine.join_group(&as_user(friend), group.id, &proof).await;
    assert!(matches!(result, Err(AppError::GroupExpired(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(friend)).await.unwrap(), 200_000);

    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.group.status, GroupStatus::Failed);
    assert_eq!(view.join_price, None);
}

// ============================================================================
// Finalization
// ============================================================================

#[tokio::test]
async fn test_finalize_rules() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &checkout(TEE, 1, 2)).await;

    let stranger = t.engine.finalize_group(&as_user(Uuid::new_v4()), group.id).await;
    assert!(matches!(stranger, Err(AppError::Unauthorized(_))));

    let empty = t.engine.finalize_group(&as_user(leader), group.id).await;
    assert!(matches!(empty, Err(AppError::InsufficientFriends(_))));

    let missing = t.engine.finalize_group(&as_user(leader), Uuid::new_v4()).await;
    assert!(matches!(missing, Err(AppError::GroupNotFound(_))));
}

#[tokio::test]
async fn test_finalize_twice_is_idempotent() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;

    let first = t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    assert!(!first.already_finalized);
    assert_eq!(first.group.status, GroupStatus::Success);
    assert_eq!(first.group.actual_friend_count, Some(2));

    let second = t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    assert!(second.already_finalized);
    assert_eq!(second.settlement, first.settlement);
    assert_eq!(t.store.settlement_count(), 1);
}

#[tokio::test]
async fn test_sweep_with_nothing_due_drops_idle_locks() {
    let t = TestEngine::new();
    for _ in 0..3 {
        let group = t.open_group(Uuid::new_v4(), &checkout(TEE, 1, 2)).await;
        t.join(Uuid::new_v4(), group.id).await.unwrap();
    }
    assert_eq!(t.locks.len(), 3);

    let report = t.engine.sweep_expired().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert!(t.locks.is_empty());
}

#[tokio::test]
async fn test_cancel_group() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &checkout(TEE, 1, 2)).await;

    let stranger = t.engine.cancel_group(&as_user(Uuid::new_v4()), group.id).await;
    assert!(matches!(stranger, Err(AppError::Unauthorized(_))));

    let cancelled = t.engine.cancel_group(&as_user(leader), group.id).await.unwrap();
    assert_eq!(cancelled.status, GroupStatus::Failed);
    assert_eq!(cancelled.actual_friend_count, Some(0));
    assert_eq!(t.store.settlement_count(), 0);

    let again = t.engine.cancel_group(&as_user(leader), group.id).await;
    assert!(matches!(again, Err(AppError::GroupNotOngoing { .. })));
}

#[tokio::test]
async fn test_cancel_after_deadline_expires_group() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &checkout(TEE, 1, 2)).await;
    let mut events = t.events.subscribe();

    t.expire_window();
    t.clock.advance(chrono::Duration::seconds(1));

    let result = t.engine.cancel_group(&as_user(leader), group.id).await;
    assert!(matches!(result, Err(AppError::GroupNotOngoing { .. })));

    match events.try_recv() {
        Ok(DomainEvent::GroupFinalized { group_id, status, reason, .. }) => {
            assert_eq!(group_id, group.id);
            assert_eq!(status, GroupStatus::Failed);
            assert_eq!(reason, TransitionReason::ExpiredWithoutFriends);
        }
        other => panic!("expected the group to expire, got {:?}", other),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_refused_once_friends_paid() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 1).await;

    let result = t.engine.cancel_group(&as_user(leader), group.id).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_zero_delta_settles_automatically() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 1).await;

    let outcome = t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    let settlement = outcome.settlement.unwrap();
    assert_eq!(settlement.delta, 0);
    assert_eq!(settlement.method, SettlementMethod::None);
    assert!(settlement.is_settled());

    let refund = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(refund, Err(AppError::DuplicateSettlement(_))));
}

// ============================================================================
// Refunds
// ============================================================================

#[tokio::test]
async fn test_wallet_refund_is_paid_once() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    let record = t.engine.get_settlement(&as_user(leader), group.id).await.unwrap();
    assert_eq!(record.direction(), SettlementDirection::Refund);
    assert_eq!(record.refund_amount(), 100_000);

    let settled = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await
        .unwrap();
    assert_eq!(settled.method, SettlementMethod::Wallet);
    assert!(settled.is_settled());

    let again = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(again, Err(AppError::DuplicateSettlement(_))));

    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 100_000);
    let transactions = t.engine.wallet_transactions(&as_user(leader)).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].kind, WalletTransactionType::SettlementRefund);
}

#[tokio::test]
async fn test_bank_card_refund() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    let invalid = t
        .engine
        .submit_refund_method(
            &as_user(leader),
            group.id,
            &RefundMethod::BankCard {
                card_number: "1234 5678 9012 3456".to_string(),
            },
        )
        .await;
    assert!(matches!(invalid, Err(AppError::InvalidCardNumber)));

    let untouched = t.engine.get_settlement(&as_user(leader), group.id).await.unwrap();
    assert!(!untouched.is_settled());
    assert_eq!(untouched.pending_operation, None);

    let settled = t
        .engine
        .submit_refund_method(
            &as_user(leader),
            group.id,
            &RefundMethod::BankCard {
                card_number: VALID_CARD.to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(settled.method, SettlementMethod::BankCardQueued);

    let wallet_after = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(wallet_after, Err(AppError::DuplicateSettlement(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_bank_card_refund_already_queued_by_racing_writer() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    t.store.lose_next_payout_race();
    let settled = t
        .engine
        .submit_refund_method(
            &as_user(leader),
            group.id,
            &RefundMethod::BankCard {
                card_number: VALID_CARD.to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(settled.method, SettlementMethod::BankCardQueued);
    assert_eq!(settled.pending_operation, None);

    let payouts = t.store.list_queued_payouts(10).await.unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 100_000);
}

#[tokio::test]
async fn test_failed_wallet_credit_can_be_retried() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    t.store.set_wallet_offline(true);
    let failed = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(failed, Err(AppError::WalletCreditFailed(_))));

    let record = t.engine.get_settlement(&as_user(leader), group.id).await.unwrap();
    assert!(!record.is_settled());
    assert_eq!(record.pending_operation, None);

    t.store.set_wallet_offline(false);
    let settled = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await
        .unwrap();
    assert!(settled.is_settled());
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 100_000);
    assert_eq!(t.store.wallet_transaction_count(), 1);
}

#[tokio::test]
async fn test_refund_method_needs_a_refund() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 3), 1).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    let result = t
        .engine
        .submit_refund_method(&as_user(leader), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(result, Err(AppError::RefundNotApplicable(_))));

    let stranger = t
        .engine
        .submit_refund_method(&as_user(Uuid::new_v4()), group.id, &RefundMethod::Wallet)
        .await;
    assert!(matches!(stranger, Err(AppError::Unauthorized(_))));
}

#[tokio::test]
async fn test_consolidated_shipping_discount() {
    let t = TestEngine::new();
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &consolidated_checkout(TEE, 1, 2)).await;
    t.join_with(Uuid::new_v4(), group.id, true).await.unwrap();

    let outcome = t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    let settlement = outcome.settlement.unwrap();
    assert_eq!(settlement.consolidation_discount, CONSOLIDATION_DISCOUNT);
    assert_eq!(settlement.delta, -CONSOLIDATION_DISCOUNT);
    assert!(!settlement.is_settled());
}

// ============================================================================
// Collection
// ============================================================================

#[tokio::test]
async fn test_collect_through_gateway() {
    let t = TestEngine::manual_payments();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 3), 1).await;
    let outcome = t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    assert_eq!(outcome.settlement.unwrap().delta, 100_000);

    let stranger = t.engine.pay_settlement(&as_user(Uuid::new_v4()), group.id, false).await;
    assert!(matches!(stranger, Err(AppError::Unauthorized(_))));

    let opened = t.engine.pay_settlement(&as_user(leader), group.id, false).await.unwrap();
    let reference = opened.gateway_reference.clone().unwrap();
    assert_eq!(opened.gateway_amount, Some(100_000));
    assert!(opened.payment_url.is_some());
    assert!(!opened.is_settled());

    // Retrying re-uses the open charge
    let charges = t.gateway.charges_created();
    let reopened = t.engine.pay_settlement(&as_user(leader), group.id, false).await.unwrap();
    assert_eq!(reopened.gateway_reference.as_deref(), Some(reference.as_str()));
    assert_eq!(t.gateway.charges_created(), charges);

    let early = t
        .engine
        .confirm_settlement_payment(&as_user(leader), group.id, &reference)
        .await;
    assert!(matches!(early, Err(AppError::PaymentNotConfirmed(_))));

    let wrong = t
        .engine
        .confirm_settlement_payment(&as_user(leader), group.id, "sim-elsewhere")
        .await;
    assert!(matches!(wrong, Err(AppError::Validation(_))));

    t.gateway.pay(&reference);
    let settled = t
        .engine
        .confirm_settlement_payment(&as_user(leader), group.id, &reference)
        .await
        .unwrap();
    assert_eq!(settled.method, SettlementMethod::GatewayCharge);

    let again = t
        .engine
        .confirm_settlement_payment(&as_user(leader), group.id, &reference)
        .await;
    assert!(matches!(again, Err(AppError::DuplicateSettlement(_))));
}

#[tokio::test]
async fn test_collect_partly_from_wallet() {
    let t = TestEngine::manual_payments();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 3), 1).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    t.store.set_balance(leader, 40_000);

    let opened = t.engine.pay_settlement(&as_user(leader), group.id, true).await.unwrap();
    assert_eq!(opened.wallet_applied, 40_000);
    assert_eq!(opened.gateway_amount, Some(60_000));
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 0);

    let reference = opened.gateway_reference.unwrap();
    t.gateway.pay(&reference);
    let settled = t
        .engine
        .confirm_settlement_payment(&as_user(leader), group.id, &reference)
        .await
        .unwrap();
    assert_eq!(settled.method, SettlementMethod::GatewayCharge);
    assert_eq!(settled.wallet_applied, 40_000);
}

#[tokio::test]
async fn test_collect_entirely_from_wallet() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 3), 1).await;
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    t.store.set_balance(leader, 150_000);

    let settled = t.engine.pay_settlement(&as_user(leader), group.id, true).await.unwrap();
    assert_eq!(settled.method, SettlementMethod::Wallet);
    assert_eq!(settled.wallet_applied, 100_000);
    assert!(settled.gateway_reference.is_none());
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 50_000);

    let again = t.engine.pay_settlement(&as_user(leader), group.id, true).await;
    assert!(matches!(again, Err(AppError::DuplicateSettlement(_))));
    assert_eq!(t.engine.wallet_balance(&as_user(leader)).await.unwrap(), 50_000);
}

#[tokio::test]
async fn test_settlement_visible_to_leader_only() {
    let t = TestEngine::new();
    let (leader, group) = t.group_with_friends(&checkout(TEE, 1, 2), 2).await;

    let before = t.engine.get_settlement(&as_user(leader), group.id).await;
    assert!(matches!(before, Err(AppError::SettlementNotFound(_))));

    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();
    assert_ok!(t.engine.get_settlement(&as_user(leader), group.id).await);
    assert_err!(t.engine.get_settlement(&as_user(Uuid::new_v4()), group.id).await);
}

// ============================================================================
// Secondary groups
// ============================================================================

async fn failed_lamp_group(t: &TestEngine) -> (Uuid, GroupPurchase) {
    let leader = Uuid::new_v4();
    let group = t.open_group(leader, &checkout(LAMP, 1, 1)).await;
    t.expire_window();
    let view = t.engine.get_group(group.id).await.unwrap();
    assert_eq!(view.group.status, GroupStatus::Failed);
    (leader, view.group)
}

#[tokio::test]
async fn test_secondary_group_from_failed_group() {
    let t = TestEngine::new();
    let (leader, source) = failed_lamp_group(&t).await;
    let request = SecondaryGroupRequest {
        source_group_id: source.id,
        expected_friend_count: 2,
    };

    let quote = t.engine.quote_secondary_group(&as_user(leader), &request).await.unwrap();
    assert_eq!(quote.kind, GroupKind::Secondary);
    assert_eq!(quote.price, 750_000);

    let session = t.engine.begin_secondary_checkout(&as_user(leader), &request).await.unwrap();
    let secondary = t
        .engine
        .create_secondary_group(&as_user(leader), &request, &session.charge.reference)
        .await
        .unwrap();
    assert_eq!(secondary.kind, GroupKind::Secondary);
    assert_eq!(secondary.source_group_id, Some(source.id));
    assert_eq!(secondary.original_basket_price, 750_000);

    let twice = t.engine.quote_secondary_group(&as_user(leader), &request).await;
    assert!(matches!(twice, Err(AppError::SecondaryGroupNotAllowed(_))));
}

#[tokio::test]
async fn test_secondary_group_restrictions() {
    let t = TestEngine::new();

    let leader = Uuid::new_v4();
    let ongoing = t.open_group(leader, &checkout(LAMP, 1, 1)).await;
    let from_ongoing = t
        .engine
        .quote_secondary_group(
            &as_user(leader),
            &SecondaryGroupRequest {
                source_group_id: ongoing.id,
                expected_friend_count: 1,
            },
        )
        .await;
    assert!(matches!(from_ongoing, Err(AppError::SecondaryGroupNotAllowed(_))));

    let (source_leader, source) = failed_lamp_group(&t).await;
    let request = SecondaryGroupRequest {
        source_group_id: source.id,
        expected_friend_count: 1,
    };

    let outsider = t.engine.quote_secondary_group(&as_user(Uuid::new_v4()), &request).await;
    assert!(matches!(outsider, Err(AppError::SecondaryGroupNotAllowed(_))));

    t.clock.advance(chrono::Duration::hours(24) + chrono::Duration::seconds(1));
    let too_late = t.engine.quote_secondary_group(&as_user(source_leader), &request).await;
    assert!(matches!(too_late, Err(AppError::SecondaryGroupNotAllowed(_))));
}

// ============================================================================
// Events and audit
// ============================================================================

#[tokio::test]
async fn test_domain_events_in_order() {
    let t = TestEngine::new();
    let mut events = t.engine.subscribe();
    let leader = Uuid::new_v4();
    let friend = Uuid::new_v4();

    let group = t.open_group(leader, &checkout(TEE, 1, 2)).await;
    t.join(friend, group.id).await.unwrap();
    t.engine.finalize_group(&as_user(leader), group.id).await.unwrap();

    let received: Vec<DomainEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    let names: Vec<&str> = received.iter().map(DomainEvent::name).collect();
    assert_eq!(
        names,
        vec!["group.created", "group.participant_joined", "group.finalized", "group.settled"]
    );

    match &received[1] {
        DomainEvent::ParticipantJoined {
            user_id,
            confirmed_friend_count,
            next_join_price,
            ..
        } => {
            assert_eq!(*user_id, friend);
            assert_eq!(*confirmed_friend_count, 1);
            assert_eq!(*next_join_price, Some(200_000));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(received.iter().all(|e| e.group_id() == group.id));
}

#[tokio::test]
async fn test_audit_trail_records_lifecycle() {
    let dir = std::env::temp_dir().join(format!("group-buy-audit-{}", Uuid::new_v4()));
    let audit = Arc::new(AuditTrailService::new(dir.clone()).unwrap());

    let store = Arc::new(group_buy_engine::repositories::InMemoryStore::new());
    let gateway = Arc::new(group_buy_engine::gateway::SimulatedGateway::auto_confirming());
    let catalog = group_buy_engine::catalog::StaticCatalog::new()
        .with_item(TEE, PricingTier::new(300_000, Some(200_000), Some(100_000), Some(0)).unwrap());
    let engine = GroupPurchaseEngine::builder(Stores::in_memory(store), Arc::new(catalog), gateway)
        .audit(audit.clone())
        .build();

    let leader = Uuid::new_v4();
    let request = checkout(TEE, 1, 2);
    let session = engine.begin_checkout(&as_user(leader), &request).await.unwrap();
    let group = engine
        .create_group(&as_user(leader), &request, &session.charge.reference)
        .await
        .unwrap();
    engine.cancel_group(&as_user(leader), group.id).await.unwrap();

    let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event_type"], "group_created");
    assert_eq!(lines[1]["event_type"], "group_finalized");
    assert_eq!(lines[1]["group_id"], group.id.to_string());

    let _ = std::fs::remove_dir_all(dir);
}
