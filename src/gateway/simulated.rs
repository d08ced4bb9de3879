use super::{ChargePurpose, ChargeRequest, ChargeSession, ChargeVerification, GatewayError, PaymentGateway};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeState {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone)]
struct SimulatedCharge {
    amount: i64,
    state: ChargeState,
    purpose: Option<ChargePurpose>,
    payer_user_id: Option<Uuid>,
    group_id: Option<Uuid>,
}

#[derive(Default)]
struct Ledger {
    charges: HashMap<String, SimulatedCharge>,
    by_key: HashMap<String, String>,
}

/// In-process gateway for development and tests.
///
/// Charges start pending unless `auto_confirm` is on; tests settle them with
/// [`SimulatedGateway::pay`] or [`SimulatedGateway::decline`].
pub struct SimulatedGateway {
    ledger: Mutex<Ledger>,
    auto_confirm: bool,
    available: AtomicBool,
    created: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            auto_confirm: false,
            available: AtomicBool::new(true),
            created: AtomicUsize::new(0),
        }
    }

    /// Every created charge is immediately paid in full
    pub fn auto_confirming() -> Self {
        Self {
            auto_confirm: true,
            ..Self::new()
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a charge as paid with the amount it was opened for
    pub fn pay(&self, reference: &str) -> bool {
        self.set_state(reference, ChargeState::Paid)
    }

    pub fn decline(&self, reference: &str) -> bool {
        self.set_state(reference, ChargeState::Failed)
    }

    fn set_state(&self, reference: &str, state: ChargeState) -> bool {
        match self.ledger().charges.get_mut(reference) {
            Some(charge) => {
                charge.state = state;
                true
            }
            None => false,
        }
    }

    /// Record a payment made outside `create_charge` (e.g. a card-present top-up)
    pub fn record_paid(&self, reference: impl Into<String>, amount: i64) {
        self.ledger().charges.insert(
            reference.into(),
            SimulatedCharge {
                amount,
                state: ChargeState::Paid,
                purpose: None,
                payer_user_id: None,
                group_id: None,
            },
        );
    }

    /// Simulate an outage; calls fail with `Unavailable` until restored
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of distinct charges opened through `create_charge`
    pub fn charges_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), GatewayError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::Unavailable("simulated outage".to_string()))
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeSession, GatewayError> {
        self.ensure_available()?;
        if request.amount <= 0 {
            return Err(GatewayError::Rejected(format!("invalid amount {}", request.amount)));
        }

        let mut ledger = self.ledger();
        let reference = match ledger.by_key.get(&request.idempotency_key) {
            Some(existing) => existing.clone(),
            None => {
                let reference = format!("sim-{}", Uuid::new_v4().simple());
                let state = if self.auto_confirm {
                    ChargeState::Paid
                } else {
                    ChargeState::Pending
                };
                ledger.charges.insert(
                    reference.clone(),
                    SimulatedCharge {
                        amount: request.amount,
                        state,
                        purpose: Some(request.purpose),
                        payer_user_id: Some(request.payer_user_id),
                        group_id: request.group_id,
                    },
                );
                ledger
                    .by_key
                    .insert(request.idempotency_key.clone(), reference.clone());
                self.created.fetch_add(1, Ordering::SeqCst);
                reference
            }
        };

        Ok(ChargeSession {
            payment_url: format!("https://pay.simulated.local/{}", reference),
            reference,
        })
    }

    async fn verify_charge(&self, reference: &str) -> Result<ChargeVerification, GatewayError> {
        self.ensure_available()?;

        let ledger = self.ledger();
        let charge = ledger
            .charges
            .get(reference)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown reference {}", reference)))?;

        let confirmed = charge.state == ChargeState::Paid;
        Ok(ChargeVerification {
            reference: reference.to_string(),
            confirmed,
            amount: if confirmed { charge.amount } else { 0 },
            purpose: charge.purpose,
            payer_user_id: charge.payer_user_id,
            group_id: charge.group_id,
        })
    }
}
