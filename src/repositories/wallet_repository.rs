//! Repository for wallet balances and their transaction log

use super::WalletRepository;
use crate::error::{RepoResult, RepositoryError};
use crate::models::{IdempotencyKey, WalletAdjustment, WalletTransaction, WalletTransactionType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, balance_before, balance_after, kind, idempotency_key, description, created_at";

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    kind: String,
    idempotency_key: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for WalletTransaction {
    type Error = RepositoryError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = WalletTransactionType::from_str(&row.kind)
            .ok_or_else(|| RepositoryError::Corrupt(format!("wallet transaction kind {}", row.kind)))?;

        Ok(WalletTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            kind,
            idempotency_key: row.idempotency_key,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

/// A replayed key must describe the same movement
pub(crate) fn check_replay(
    existing: WalletTransaction,
    user_id: Uuid,
    amount: i64,
) -> RepoResult<WalletAdjustment> {
    if existing.user_id != user_id || existing.amount != amount {
        return Err(RepositoryError::Duplicate(format!(
            "idempotency key {} already used for a different movement",
            existing.idempotency_key
        )));
    }
    Ok(WalletAdjustment {
        transaction: existing,
        applied: false,
    })
}

pub struct PgWalletRepository {
    pool: PgPool,
}

impl PgWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletRepository for PgWalletRepository {
    async fn get_balance(&self, user_id: Uuid) -> RepoResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT balance FROM wallet_balances WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(balance.unwrap_or(0))
    }

    async fn adjust_balance(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: WalletTransactionType,
        key: &IdempotencyKey,
        description: Option<&str>,
    ) -> RepoResult<WalletAdjustment> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO wallet_balances (user_id, balance, updated_at)
            VALUES ($1, 0, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        // Row lock serializes movements of one user, replays included
        let balance_before: i64 = sqlx::query_scalar("SELECT balance FROM wallet_balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM wallet_transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.rollback().await?;
            return check_replay(WalletTransaction::try_from(row)?, user_id, amount);
        }

        let balance_after = balance_before
            .checked_add(amount)
            .ok_or_else(|| RepositoryError::InvalidInput("wallet balance overflow".to_string()))?;
        if balance_after < 0 {
            tx.rollback().await?;
            return Err(RepositoryError::BusinessRule(format!(
                "insufficient wallet balance: have {}, need {}",
                balance_before, -amount
            )));
        }

        sqlx::query("UPDATE wallet_balances SET balance = $2, updated_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .bind(balance_after)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO wallet_transactions
                (id, user_id, amount, balance_before, balance_after, kind, idempotency_key, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount)
        .bind(balance_before)
        .bind(balance_after)
        .bind(kind.as_str())
        .bind(key.as_str())
        .bind(description)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(%user_id, amount, balance_after, key = %key, "Wallet adjusted");

        Ok(WalletAdjustment {
            transaction: WalletTransaction::try_from(row)?,
            applied: true,
        })
    }

    async fn find_transaction(&self, key: &IdempotencyKey) -> RepoResult<Option<WalletTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM wallet_transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(WalletTransaction::try_from).transpose()
    }

    async fn list_transactions(&self, user_id: Uuid) -> RepoResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM wallet_transactions WHERE user_id = $1 ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WalletTransaction::try_from).collect()
    }
}
