//! Tiered group pricing.

pub mod tier_resolver;

pub use tier_resolver::{
    basket_price, checkout_price, join_price, parse_kind, resolve_price, PricingError, PricingResult,
};
