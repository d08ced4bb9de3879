use crate::error::{AppError, AppResult};
use crate::models::GroupKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a settlement was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMethod {
    None,
    Wallet,
    BankCardQueued,
    GatewayCharge,
}

impl SettlementMethod {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(SettlementMethod::None),
            "wallet" => Ok(SettlementMethod::Wallet),
            "bank_card_queued" => Ok(SettlementMethod::BankCardQueued),
            "gateway_charge" => Ok(SettlementMethod::GatewayCharge),
            _ => Err(format!("Invalid settlement method: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementMethod::None => "none",
            SettlementMethod::Wallet => "wallet",
            SettlementMethod::BankCardQueued => "bank_card_queued",
            SettlementMethod::GatewayCharge => "gateway_charge",
        }
    }
}

/// Payout intent reserved on a record while the external call is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperation {
    WalletCredit,
    WalletDebit,
    GatewayCharge,
    BankCard,
}

impl PendingOperation {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "wallet_credit" => Ok(PendingOperation::WalletCredit),
            "wallet_debit" => Ok(PendingOperation::WalletDebit),
            "gateway_charge" => Ok(PendingOperation::GatewayCharge),
            "bank_card" => Ok(PendingOperation::BankCard),
            _ => Err(format!("Invalid pending operation: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperation::WalletCredit => "wallet_credit",
            PendingOperation::WalletDebit => "wallet_debit",
            PendingOperation::GatewayCharge => "gateway_charge",
            PendingOperation::BankCard => "bank_card",
        }
    }
}

/// Sign of a settlement delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementDirection {
    /// Leader owes more
    Collect,
    /// Leader is owed a refund
    Refund,
    Even,
}

/// Refund path chosen by the leader for a negative delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RefundMethod {
    Wallet,
    BankCard { card_number: String },
}

/// Post-finalization reconciliation of a successful group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub group_id: Uuid,
    pub leader_user_id: Uuid,
    pub kind: GroupKind,
    pub expected_friend_count: i32,
    pub actual_friend_count: i32,
    pub original_basket_price: i64,
    pub final_basket_price: i64,
    pub consolidation_discount: i64,
    /// final - original - discount; negative means a refund is due
    pub delta: i64,
    pub method: SettlementMethod,
    /// Part of a positive delta already covered from the leader's wallet
    pub wallet_applied: i64,
    pub pending_operation: Option<PendingOperation>,
    pub gateway_reference: Option<String>,
    pub gateway_amount: Option<i64>,
    pub payment_url: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Bumped by every persisted update
    pub version: i32,
}

impl SettlementRecord {
    pub fn direction(&self) -> SettlementDirection {
        match self.delta {
            d if d > 0 => SettlementDirection::Collect,
            d if d < 0 => SettlementDirection::Refund,
            _ => SettlementDirection::Even,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }

    /// Amount owed back to the leader (zero unless the delta is negative)
    pub fn refund_amount(&self) -> i64 {
        if self.delta < 0 {
            -self.delta
        } else {
            0
        }
    }

    /// Amount the leader still has to pay through the gateway
    pub fn outstanding(&self) -> i64 {
        if self.delta > 0 {
            (self.delta - self.wallet_applied).max(0)
        } else {
            0
        }
    }

    /// Reserve a payout intent. Re-reserving the same intent is allowed so an
    /// interrupted call can be retried with its idempotency key.
    pub fn reserve(&mut self, operation: PendingOperation) -> AppResult<()> {
        if self.is_settled() {
            return Err(AppError::DuplicateSettlement(self.group_id));
        }
        match self.pending_operation {
            Some(current) if current != operation => Err(AppError::DuplicateSettlement(self.group_id)),
            _ => {
                self.pending_operation = Some(operation);
                Ok(())
            }
        }
    }

    pub fn release(&mut self) {
        self.pending_operation = None;
    }

    /// Record the terminal payout method; only ever happens once
    pub fn settle(&mut self, method: SettlementMethod, at: DateTime<Utc>) -> AppResult<()> {
        if self.is_settled() {
            return Err(AppError::DuplicateSettlement(self.group_id));
        }

        let allowed = match self.direction() {
            SettlementDirection::Even => method == SettlementMethod::None,
            SettlementDirection::Collect => {
                matches!(method, SettlementMethod::Wallet | SettlementMethod::GatewayCharge)
            }
            SettlementDirection::Refund => {
                matches!(method, SettlementMethod::Wallet | SettlementMethod::BankCardQueued)
            }
        };
        if !allowed {
            return Err(AppError::Message(format!(
                "method {} does not match a {:?} settlement",
                method.as_str(),
                self.direction()
            )));
        }

        self.method = method;
        self.settled_at = Some(at);
        self.pending_operation = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(delta: i64) -> SettlementRecord {
        SettlementRecord {
            group_id: Uuid::new_v4(),
            leader_user_id: Uuid::new_v4(),
            kind: GroupKind::Regular,
            expected_friend_count: 2,
            actual_friend_count: 1,
            original_basket_price: 200_000,
            final_basket_price: 200_000 + delta,
            consolidation_discount: 0,
            delta,
            method: SettlementMethod::None,
            wallet_applied: 0,
            pending_operation: None,
            gateway_reference: None,
            gateway_amount: None,
            payment_url: None,
            settled_at: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn test_direction_and_amounts() {
        let refund = record(-50_000);
        assert_eq!(refund.direction(), SettlementDirection::Refund);
        assert_eq!(refund.refund_amount(), 50_000);
        assert_eq!(refund.outstanding(), 0);

        let mut collect = record(80_000);
        collect.wallet_applied = 30_000;
        assert_eq!(collect.direction(), SettlementDirection::Collect);
        assert_eq!(collect.outstanding(), 50_000);

        assert_eq!(record(0).direction(), SettlementDirection::Even);
    }

    #[test]
    fn test_settle_only_once() {
        let mut rec = record(-10);
        rec.settle(SettlementMethod::Wallet, Utc::now()).unwrap();
        let again = rec.settle(SettlementMethod::BankCardQueued, Utc::now());
        assert!(matches!(again, Err(AppError::DuplicateSettlement(_))));
        assert_eq!(rec.method, SettlementMethod::Wallet);
    }

    #[test]
    fn test_settle_rejects_method_for_wrong_direction() {
        let mut rec = record(10);
        assert!(rec.settle(SettlementMethod::BankCardQueued, Utc::now()).is_err());
        assert!(!rec.is_settled());
    }

    #[test]
    fn test_reserve_conflicts() {
        let mut rec = record(-10);
        rec.reserve(PendingOperation::WalletCredit).unwrap();
        rec.reserve(PendingOperation::WalletCredit).unwrap();
        assert!(rec.reserve(PendingOperation::BankCard).is_err());
        rec.release();
        rec.reserve(PendingOperation::BankCard).unwrap();
    }
}
