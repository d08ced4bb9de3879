use super::SettlementRepository;
use crate::error::{RepoResult, RepositoryError};
use crate::models::{GroupKind, PendingOperation, SettlementMethod, SettlementRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const SETTLEMENT_COLUMNS: &str = "group_id, leader_user_id, kind, expected_friend_count, actual_friend_count, \
     original_basket_price, final_basket_price, consolidation_discount, delta, method, wallet_applied, \
     pending_operation, gateway_reference, gateway_amount, payment_url, settled_at, created_at, version";

#[derive(sqlx::FromRow)]
struct SettlementRow {
    group_id: Uuid,
    leader_user_id: Uuid,
    kind: String,
    expected_friend_count: i32,
    actual_friend_count: i32,
    original_basket_price: i64,
    final_basket_price: i64,
    consolidation_discount: i64,
    delta: i64,
    method: String,
    wallet_applied: i64,
    pending_operation: Option<String>,
    gateway_reference: Option<String>,
    gateway_amount: Option<i64>,
    payment_url: Option<String>,
    settled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    version: i32,
}

impl TryFrom<SettlementRow> for SettlementRecord {
    type Error = RepositoryError;

    fn try_from(row: SettlementRow) -> Result<Self, Self::Error> {
        let pending_operation = row
            .pending_operation
            .as_deref()
            .map(PendingOperation::from_str)
            .transpose()
            .map_err(RepositoryError::Corrupt)?;

        Ok(SettlementRecord {
            group_id: row.group_id,
            leader_user_id: row.leader_user_id,
            kind: GroupKind::from_str(&row.kind).map_err(RepositoryError::Corrupt)?,
            expected_friend_count: row.expected_friend_count,
            actual_friend_count: row.actual_friend_count,
            original_basket_price: row.original_basket_price,
            final_basket_price: row.final_basket_price,
            consolidation_discount: row.consolidation_discount,
            delta: row.delta,
            method: SettlementMethod::from_str(&row.method).map_err(RepositoryError::Corrupt)?,
            wallet_applied: row.wallet_applied,
            pending_operation,
            gateway_reference: row.gateway_reference,
            gateway_amount: row.gateway_amount,
            payment_url: row.payment_url,
            settled_at: row.settled_at,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

/// Insert a fresh settlement inside the finalization transaction
pub(crate) async fn insert_settlement(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &SettlementRecord,
) -> RepoResult<()> {
    sqlx::query(&format!(
        "INSERT INTO settlement_records ({}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        SETTLEMENT_COLUMNS
    ))
    .bind(record.group_id)
    .bind(record.leader_user_id)
    .bind(record.kind.as_str())
    .bind(record.expected_friend_count)
    .bind(record.actual_friend_count)
    .bind(record.original_basket_price)
    .bind(record.final_basket_price)
    .bind(record.consolidation_discount)
    .bind(record.delta)
    .bind(record.method.as_str())
    .bind(record.wallet_applied)
    .bind(record.pending_operation.map(|op| op.as_str()))
    .bind(&record.gateway_reference)
    .bind(record.gateway_amount)
    .bind(&record.payment_url)
    .bind(record.settled_at)
    .bind(record.created_at)
    .bind(record.version)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementRepository for PgSettlementRepository {
    async fn find_settlement(&self, group_id: Uuid) -> RepoResult<Option<SettlementRecord>> {
        let row = sqlx::query_as::<_, SettlementRow>(&format!(
            "SELECT {} FROM settlement_records WHERE group_id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SettlementRecord::try_from).transpose()
    }

    async fn update_settlement(&self, record: &SettlementRecord) -> RepoResult<SettlementRecord> {
        // Amounts are immutable; only the dispatch state moves
        let row = sqlx::query_as::<_, SettlementRow>(&format!(
            r#"
            UPDATE settlement_records
            SET method = $3,
                wallet_applied = $4,
                pending_operation = $5,
                gateway_reference = $6,
                gateway_amount = $7,
                payment_url = $8,
                settled_at = $9,
                version = version + 1
            WHERE group_id = $1 AND version = $2
            RETURNING {}
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(record.group_id)
        .bind(record.version)
        .bind(record.method.as_str())
        .bind(record.wallet_applied)
        .bind(record.pending_operation.map(|op| op.as_str()))
        .bind(&record.gateway_reference)
        .bind(record.gateway_amount)
        .bind(&record.payment_url)
        .bind(record.settled_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => SettlementRecord::try_from(row),
            None => Err(RepositoryError::Conflict(format!(
                "settlement {} is not at version {}",
                record.group_id, record.version
            ))),
        }
    }
}
