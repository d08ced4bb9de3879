use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tier prices of one catalog item, as supplied by the catalog
///
/// Tier prices are optional; a missing tier is derived from the solo
/// price by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub solo_price: i64,
    #[serde(default)]
    pub friend1_price: Option<i64>,
    #[serde(default)]
    pub friend2_price: Option<i64>,
    #[serde(default)]
    pub friend3_price: Option<i64>,
}

impl PricingTier {
    /// Build a validated tier: non-negative and non-increasing from solo downward
    pub fn new(
        solo_price: i64,
        friend1_price: Option<i64>,
        friend2_price: Option<i64>,
        friend3_price: Option<i64>,
    ) -> AppResult<Self> {
        let tier = Self {
            solo_price,
            friend1_price,
            friend2_price,
            friend3_price,
        };
        tier.validate()?;
        Ok(tier)
    }

    /// Tier with only a solo price; every friend tier falls back to the formula
    pub fn solo_only(solo_price: i64) -> AppResult<Self> {
        Self::new(solo_price, None, None, None)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.solo_price < 0 {
            return Err(AppError::InvalidPricingTier(format!(
                "solo price must be non-negative, got {}",
                self.solo_price
            )));
        }

        let mut ceiling = self.solo_price;
        for (label, price) in [
            ("friend1", self.friend1_price),
            ("friend2", self.friend2_price),
            ("friend3", self.friend3_price),
        ] {
            if let Some(price) = price {
                if price < 0 {
                    return Err(AppError::InvalidPricingTier(format!(
                        "{} price must be non-negative, got {}",
                        label, price
                    )));
                }
                if price > ceiling {
                    return Err(AppError::InvalidPricingTier(format!(
                        "{} price {} exceeds the previous tier {}",
                        label, price, ceiling
                    )));
                }
                ceiling = price;
            }
        }

        Ok(())
    }
}

/// Item requested at checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketItemRequest {
    pub item_id: String,
    pub quantity: i32,
}

/// Basket line of a group with the tier snapshot taken at checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketLine {
    pub group_id: Uuid,
    pub item_id: String,
    pub quantity: i32,
    pub tier: PricingTier,
}

impl BasketLine {
    pub fn new(group_id: Uuid, item_id: impl Into<String>, quantity: i32, tier: PricingTier) -> Self {
        Self {
            group_id,
            item_id: item_id.into(),
            quantity,
            tier,
        }
    }

    /// Copy of this line attached to another group
    pub fn for_group(&self, group_id: Uuid) -> Self {
        Self {
            group_id,
            ..self.clone()
        }
    }
}
