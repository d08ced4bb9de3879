//! Domain models for the group purchase engine.
//!
//! This module contains the persisted entities of a group purchase:
//! the group aggregate itself, its participants and basket snapshot,
//! the settlement record, wallet movements and queued bank-card payouts.

pub mod basket;
pub mod group_purchase;
pub mod participant;
pub mod payout;
pub mod settlement;
pub mod wallet;

// Re-export all models for convenient access
pub use basket::{BasketItemRequest, BasketLine, PricingTier};
pub use group_purchase::{GroupKind, GroupPurchase, GroupStatus, StatusTransition, TransitionReason};
pub use participant::{confirmed_friend_count, Participant, PaymentProof};
pub use payout::{BankCardPayout, CardNumber, PayoutStatus};
pub use settlement::{
    PendingOperation, RefundMethod, SettlementDirection, SettlementMethod, SettlementRecord,
};
pub use wallet::{IdempotencyKey, WalletAdjustment, WalletBalance, WalletTransaction, WalletTransactionType};
