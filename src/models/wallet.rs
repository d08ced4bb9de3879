//! Wallet balance and transaction models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wallet balance of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub user_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// Transaction types for wallet movements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletTransactionType {
    SettlementRefund,
    SettlementDebit,
    JoinRefund,
    JoinOverpayRefund,
    CheckoutRefund,
}

impl WalletTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SettlementRefund => "settlement_refund",
            Self::SettlementDebit => "settlement_debit",
            Self::JoinRefund => "join_refund",
            Self::JoinOverpayRefund => "join_overpay_refund",
            Self::CheckoutRefund => "checkout_refund",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "settlement_refund" => Some(Self::SettlementRefund),
            "settlement_debit" => Some(Self::SettlementDebit),
            "join_refund" => Some(Self::JoinRefund),
            "join_overpay_refund" => Some(Self::JoinOverpayRefund),
            "checkout_refund" => Some(Self::CheckoutRefund),
            _ => None,
        }
    }
}

/// Server-persisted key gating every payout-triggering operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for a settlement operation of a group, e.g. `settlement:<id>:wallet_credit`
    pub fn settlement(group_id: Uuid, operation: &str) -> Self {
        Self(format!("settlement:{}:{}", group_id, operation))
    }

    /// Key for refunding a rejected join payment
    pub fn join_refund(payment_reference: &str) -> Self {
        Self(format!("join-refund:{}", payment_reference))
    }

    /// Key for returning what a friend paid above the price they joined at
    pub fn join_overpay(payment_reference: &str) -> Self {
        Self(format!("join-overpay:{}", payment_reference))
    }

    /// Key for refunding a checkout payment that could not open a group
    pub fn checkout_refund(payment_reference: &str) -> Self {
        Self(format!("checkout-refund:{}", payment_reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction record for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: credits are positive, debits negative
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub kind: WalletTransactionType,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an idempotent balance adjustment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAdjustment {
    pub transaction: WalletTransaction,
    /// False when the key had already been used and nothing changed
    pub applied: bool,
}
