use super::PayoutRepository;
use crate::error::{RepoResult, RepositoryError};
use crate::models::{BankCardPayout, PayoutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const PAYOUT_COLUMNS: &str =
    "id, group_id, user_id, card_number, card_fingerprint, amount, status, idempotency_key, queued_at";

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: Uuid,
    group_id: Uuid,
    user_id: Uuid,
    card_number: String,
    card_fingerprint: String,
    amount: i64,
    status: String,
    idempotency_key: String,
    queued_at: DateTime<Utc>,
}

impl TryFrom<PayoutRow> for BankCardPayout {
    type Error = RepositoryError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        Ok(BankCardPayout {
            id: row.id,
            group_id: row.group_id,
            user_id: row.user_id,
            card_number: row.card_number,
            card_fingerprint: row.card_fingerprint,
            amount: row.amount,
            status: PayoutStatus::from_str(&row.status).map_err(RepositoryError::Corrupt)?,
            idempotency_key: row.idempotency_key,
            queued_at: row.queued_at,
        })
    }
}

pub struct PgPayoutRepository {
    pool: PgPool,
}

impl PgPayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PayoutRepository for PgPayoutRepository {
    async fn enqueue_payout(&self, payout: &BankCardPayout) -> RepoResult<BankCardPayout> {
        // A second payout for the same group trips the group_id unique index
        let inserted = sqlx::query_as::<_, PayoutRow>(&format!(
            r#"
            INSERT INTO bank_card_payouts ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {cols}
            "#,
            cols = PAYOUT_COLUMNS
        ))
        .bind(payout.id)
        .bind(payout.group_id)
        .bind(payout.user_id)
        .bind(&payout.card_number)
        .bind(&payout.card_fingerprint)
        .bind(payout.amount)
        .bind(payout.status.as_str())
        .bind(&payout.idempotency_key)
        .bind(payout.queued_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return BankCardPayout::try_from(row);
        }

        let existing = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {} FROM bank_card_payouts WHERE idempotency_key = $1",
            PAYOUT_COLUMNS
        ))
        .bind(&payout.idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        let existing = BankCardPayout::try_from(existing)?;
        if existing.group_id != payout.group_id || existing.amount != payout.amount {
            return Err(RepositoryError::Duplicate(format!(
                "idempotency key {} already used for another payout",
                payout.idempotency_key
            )));
        }
        Ok(existing)
    }

    async fn find_payout_by_group(&self, group_id: Uuid) -> RepoResult<Option<BankCardPayout>> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {} FROM bank_card_payouts WHERE group_id = $1",
            PAYOUT_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BankCardPayout::try_from).transpose()
    }

    async fn list_queued_payouts(&self, limit: i64) -> RepoResult<Vec<BankCardPayout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {} FROM bank_card_payouts WHERE status = 'queued' ORDER BY queued_at LIMIT $1",
            PAYOUT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BankCardPayout::try_from).collect()
    }
}
