//! Payment gateway seam.
//!
//! Checkout, join and settlement collection all go through a hosted payment
//! page: the engine opens a charge, the payer completes it on the gateway,
//! and the engine verifies the reference before trusting it.

mod http;
mod simulated;

pub use http::HttpPaymentGateway;
pub use simulated::SimulatedGateway;

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout or 5xx; safe to retry
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => AppError::GatewayUnavailable(msg),
            GatewayError::Rejected(msg) => AppError::PaymentNotConfirmed(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePurpose {
    Checkout,
    Join,
    Settlement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub payer_user_id: Uuid,
    /// Group being paid for; unknown for a checkout that has not opened its group yet
    pub group_id: Option<Uuid>,
    pub amount: i64,
    pub purpose: ChargePurpose,
    /// Same key ⇒ same charge on the gateway side
    pub idempotency_key: String,
}

/// Hosted payment page the payer is sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeSession {
    pub reference: String,
    pub payment_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeVerification {
    pub reference: String,
    pub confirmed: bool,
    /// Amount actually captured; zero unless confirmed
    pub amount: i64,
    /// Echoed from the charge metadata when the gateway knows it
    pub purpose: Option<ChargePurpose>,
    pub payer_user_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
}

impl ChargeVerification {
    /// Confirmed, and not opened for another purpose or payer
    pub fn is_valid_for(&self, purpose: ChargePurpose, payer_user_id: Uuid) -> bool {
        self.confirmed
            && self.purpose.map_or(true, |p| p == purpose)
            && self.payer_user_id.map_or(true, |u| u == payer_user_id)
    }

    /// False when the charge was opened for a different group
    pub fn is_for_group(&self, group_id: Uuid) -> bool {
        self.group_id.map_or(true, |g| g == group_id)
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeSession, GatewayError>;

    async fn verify_charge(&self, reference: &str) -> Result<ChargeVerification, GatewayError>;
}
