use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Bank card number accepted for out-of-band refunds
#[derive(Clone, PartialEq, Eq)]
pub struct CardNumber(String);

impl CardNumber {
    /// Parse a 16-digit card number; spaces and dashes are ignored.
    pub fn parse(input: &str) -> AppResult<Self> {
        let digits: String = input.chars().filter(|c| !matches!(c, ' ' | '-')).collect();

        if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::InvalidCardNumber);
        }
        if !luhn_valid(&digits) {
            return Err(AppError::InvalidCardNumber);
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six and last four digits, as printed on receipts
    pub fn masked(&self) -> String {
        format!("{}******{}", &self.0[..6], &self.0[12..])
    }

    /// SHA-256 of the digits, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for CardNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CardNumber").field(&self.masked()).finish()
    }
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Payout status; only `Queued` is written by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Queued,
    Paid,
    Rejected,
}

impl PayoutStatus {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(PayoutStatus::Queued),
            "paid" => Ok(PayoutStatus::Paid),
            "rejected" => Ok(PayoutStatus::Rejected),
            _ => Err(format!("Invalid payout status: {}", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Queued => "queued",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Rejected => "rejected",
        }
    }
}

/// Bank-card refund waiting for the ops team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankCardPayout {
    pub id: Uuid,
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub card_number: String,
    pub card_fingerprint: String,
    pub amount: i64,
    pub status: PayoutStatus,
    pub idempotency_key: String,
    pub queued_at: DateTime<Utc>,
}

impl BankCardPayout {
    pub fn queued(
        group_id: Uuid,
        user_id: Uuid,
        card: &CardNumber,
        amount: i64,
        idempotency_key: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            user_id,
            card_number: card.as_str().to_string(),
            card_fingerprint: card.fingerprint(),
            amount,
            status: PayoutStatus::Queued,
            idempotency_key: idempotency_key.to_string(),
            queued_at: at,
        }
    }
}
