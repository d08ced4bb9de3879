use crate::error::AppError;
use crate::models::{BasketLine, GroupKind, PricingTier};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Error types for pricing operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PricingError {
    #[error("Friend count must be non-negative, got {0}")]
    NegativeFriendCount(i32),

    #[error("Unknown group kind: {0}")]
    UnknownGroupKind(String),

    #[error("Invalid quantity {quantity} for item {item_id}")]
    InvalidQuantity { item_id: String, quantity: i32 },

    #[error("Expected friend count {expected} outside 1..={cap}")]
    InvalidExpectedFriendCount { expected: i32, cap: i32 },

    #[error("Basket price overflow")]
    Overflow,

    #[error("Calculation error: {0}")]
    Calculation(String),
}

/// Result type for pricing operations
pub type PricingResult<T> = Result<T, PricingError>;

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Parse a stored or user-supplied group kind
pub fn parse_kind(kind: &str) -> PricingResult<GroupKind> {
    GroupKind::from_str(kind).map_err(|_| PricingError::UnknownGroupKind(kind.to_string()))
}

/// Per-unit price owed at `confirmed_friend_count` paid friends.
///
/// Regular groups: 0 and 1 friends use the friend-1 tier, 2 uses friend-2,
/// 3 or more is free. A missing tier becomes `round(solo / (tier + 1))`, and
/// a tier is never priced above the one before it.
///
/// Secondary groups: every paid friend removes a quarter of the solo price.
pub fn resolve_price(
    tier: &PricingTier,
    confirmed_friend_count: i32,
    kind: GroupKind,
) -> PricingResult<i64> {
    if confirmed_friend_count < 0 {
        return Err(PricingError::NegativeFriendCount(confirmed_friend_count));
    }

    let price = match kind {
        GroupKind::Regular => resolve_regular(tier, confirmed_friend_count)?,
        GroupKind::Secondary => resolve_secondary(tier, confirmed_friend_count)?,
    };

    Ok(price.max(0))
}

fn resolve_regular(tier: &PricingTier, confirmed_friend_count: i32) -> PricingResult<i64> {
    let cap = GroupKind::Regular.friend_cap();
    if confirmed_friend_count >= cap {
        return Ok(0);
    }

    let friend1 = match tier.friend1_price {
        Some(price) => price,
        None => divide_rounded(tier.solo_price, 2)?,
    }
    .min(tier.solo_price);

    if confirmed_friend_count <= 1 {
        return Ok(friend1);
    }

    let friend2 = match tier.friend2_price {
        Some(price) => price,
        None => divide_rounded(tier.solo_price, 3)?,
    };

    Ok(friend2.min(friend1))
}

fn resolve_secondary(tier: &PricingTier, confirmed_friend_count: i32) -> PricingResult<i64> {
    let cap = GroupKind::Secondary.friend_cap();
    if confirmed_friend_count >= cap {
        return Ok(0);
    }

    let remaining_quarters = i64::from(cap - confirmed_friend_count);
    let scaled = tier
        .solo_price
        .checked_mul(remaining_quarters)
        .ok_or(PricingError::Overflow)?;

    divide_rounded(scaled, i64::from(cap))
}

/// Integer division rounded half away from zero
fn divide_rounded(numerator: i64, denominator: i64) -> PricingResult<i64> {
    if denominator == 0 {
        return Err(PricingError::Calculation("division by zero".to_string()));
    }

    (Decimal::from(numerator) / Decimal::from(denominator))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(PricingError::Overflow)
}

/// Basket total at a friend count: each item priced per unit, then summed exactly
pub fn basket_price(lines: &[BasketLine], friend_count: i32, kind: GroupKind) -> PricingResult<i64> {
    lines.iter().try_fold(0i64, |total, line| {
        if line.quantity <= 0 {
            return Err(PricingError::InvalidQuantity {
                item_id: line.item_id.clone(),
                quantity: line.quantity,
            });
        }

        let unit = resolve_price(&line.tier, friend_count, kind)?;
        let line_total = unit
            .checked_mul(i64::from(line.quantity))
            .ok_or(PricingError::Overflow)?;

        total.checked_add(line_total).ok_or(PricingError::Overflow)
    })
}

/// What the leader pays at checkout for an expected number of friends.
///
/// The leader is priced as if one fewer friend had joined: a leader expecting
/// `n` friends pays the basket price at `n - 1`.
pub fn checkout_price(lines: &[BasketLine], expected_friend_count: i32, kind: GroupKind) -> PricingResult<i64> {
    let cap = kind.friend_cap();
    if expected_friend_count < 1 || expected_friend_count > cap {
        return Err(PricingError::InvalidExpectedFriendCount {
            expected: expected_friend_count,
            cap,
        });
    }

    basket_price(lines, expected_friend_count - 1, kind)
}

/// What the next friend pays when `confirmed_friend_count` friends have
/// already paid; `None` once the group is at its cap.
pub fn join_price(lines: &[BasketLine], confirmed_friend_count: i32, kind: GroupKind) -> PricingResult<Option<i64>> {
    if confirmed_friend_count >= kind.friend_cap() {
        return Ok(None);
    }
    basket_price(lines, confirmed_friend_count, kind).map(Some)
}
