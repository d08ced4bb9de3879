//! Postgres storage for group purchases, their basket snapshot, participants
//! and the transition log

use super::settlement_repository::insert_settlement;
use super::GroupPurchaseRepository;
use crate::error::{RepoResult, RepositoryError};
use crate::models::{
    BasketLine, GroupKind, GroupPurchase, GroupStatus, Participant, PricingTier, SettlementRecord, StatusTransition,
    TransitionReason,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

const GROUP_COLUMNS: &str = "id, leader_user_id, kind, status, expected_friend_count, actual_friend_count, \
     consolidate_shipments, original_basket_price, leader_payment_reference, source_group_id, \
     created_at, expires_at, finalized_at";

const PARTICIPANT_COLUMNS: &str = "id, group_id, user_id, is_leader, paid, paid_at, amount_paid, \
     payment_reference, consolidate_with_leader, created_at";

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: Uuid,
    leader_user_id: Uuid,
    kind: String,
    status: String,
    expected_friend_count: i32,
    actual_friend_count: Option<i32>,
    consolidate_shipments: bool,
    original_basket_price: i64,
    leader_payment_reference: String,
    source_group_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<GroupRow> for GroupPurchase {
    type Error = RepositoryError;

    fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
        Ok(GroupPurchase {
            id: row.id,
            leader_user_id: row.leader_user_id,
            kind: GroupKind::from_str(&row.kind).map_err(RepositoryError::Corrupt)?,
            status: GroupStatus::from_str(&row.status).map_err(RepositoryError::Corrupt)?,
            expected_friend_count: row.expected_friend_count,
            actual_friend_count: row.actual_friend_count,
            consolidate_shipments: row.consolidate_shipments,
            original_basket_price: row.original_basket_price,
            leader_payment_reference: row.leader_payment_reference,
            source_group_id: row.source_group_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            finalized_at: row.finalized_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BasketRow {
    group_id: Uuid,
    item_id: String,
    quantity: i32,
    solo_price: i64,
    friend1_price: Option<i64>,
    friend2_price: Option<i64>,
    friend3_price: Option<i64>,
}

impl From<BasketRow> for BasketLine {
    fn from(row: BasketRow) -> Self {
        // Stored tiers were validated on the way in
        BasketLine::new(
            row.group_id,
            row.item_id,
            row.quantity,
            PricingTier {
                solo_price: row.solo_price,
                friend1_price: row.friend1_price,
                friend2_price: row.friend2_price,
                friend3_price: row.friend3_price,
            },
        )
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    id: Uuid,
    group_id: Uuid,
    user_id: Option<Uuid>,
    is_leader: bool,
    paid: bool,
    paid_at: Option<DateTime<Utc>>,
    amount_paid: i64,
    payment_reference: Option<String>,
    consolidate_with_leader: bool,
    created_at: DateTime<Utc>,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Participant {
            id: row.id,
            group_id: row.group_id,
            user_id: row.user_id,
            is_leader: row.is_leader,
            paid: row.paid,
            paid_at: row.paid_at,
            amount_paid: row.amount_paid,
            payment_reference: row.payment_reference,
            consolidate_with_leader: row.consolidate_with_leader,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    group_id: Uuid,
    from_status: String,
    to_status: String,
    reason: String,
    at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for StatusTransition {
    type Error = RepositoryError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(StatusTransition {
            group_id: row.group_id,
            from: GroupStatus::from_str(&row.from_status).map_err(RepositoryError::Corrupt)?,
            to: GroupStatus::from_str(&row.to_status).map_err(RepositoryError::Corrupt)?,
            reason: TransitionReason::from_str(&row.reason).map_err(RepositoryError::Corrupt)?,
            at: row.at,
        })
    }
}

pub struct PgGroupPurchaseRepository {
    pool: PgPool,
}

impl PgGroupPurchaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupPurchaseRepository for PgGroupPurchaseRepository {
    async fn insert_group(
        &self,
        group: &GroupPurchase,
        basket: &[BasketLine],
        leader: &Participant,
    ) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO group_purchases
                (id, leader_user_id, kind, status, expected_friend_count, actual_friend_count,
                 consolidate_shipments, original_basket_price, leader_payment_reference,
                 source_group_id, created_at, expires_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(group.id)
        .bind(group.leader_user_id)
        .bind(group.kind.as_str())
        .bind(group.status.as_str())
        .bind(group.expected_friend_count)
        .bind(group.actual_friend_count)
        .bind(group.consolidate_shipments)
        .bind(group.original_basket_price)
        .bind(&group.leader_payment_reference)
        .bind(group.source_group_id)
        .bind(group.created_at)
        .bind(group.expires_at)
        .bind(group.finalized_at)
        .execute(&mut *tx)
        .await?;

        for line in basket {
            sqlx::query(
                r#"
                INSERT INTO basket_lines
                    (group_id, item_id, quantity, solo_price, friend1_price, friend2_price, friend3_price)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(group.id)
            .bind(&line.item_id)
            .bind(line.quantity)
            .bind(line.tier.solo_price)
            .bind(line.tier.friend1_price)
            .bind(line.tier.friend2_price)
            .bind(line.tier.friend3_price)
            .execute(&mut *tx)
            .await?;
        }

        insert_participant(&mut tx, leader).await?;

        tx.commit().await?;
        debug!(group_id = %group.id, lines = basket.len(), "Group persisted");
        Ok(())
    }

    async fn find_group(&self, group_id: Uuid) -> RepoResult<Option<GroupPurchase>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {} FROM group_purchases WHERE id = $1",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GroupPurchase::try_from).transpose()
    }

    async fn find_basket(&self, group_id: Uuid) -> RepoResult<Vec<BasketLine>> {
        let rows = sqlx::query_as::<_, BasketRow>(
            r#"
            SELECT group_id, item_id, quantity, solo_price, friend1_price, friend2_price, friend3_price
            FROM basket_lines
            WHERE group_id = $1
            ORDER BY item_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BasketLine::from).collect())
    }

    async fn find_participants(&self, group_id: Uuid) -> RepoResult<Vec<Participant>> {
        let rows = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants WHERE group_id = $1 ORDER BY created_at, id",
            PARTICIPANT_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Participant::from).collect())
    }

    async fn find_participant_by_payment(&self, reference: &str) -> RepoResult<Option<Participant>> {
        let row = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants WHERE payment_reference = $1",
            PARTICIPANT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Participant::from))
    }

    async fn append_paid_participant(&self, participant: &Participant) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM group_purchases WHERE id = $1 FOR UPDATE")
                .bind(participant.group_id)
                .fetch_optional(&mut *tx)
                .await?;

        match status.as_deref() {
            None => {
                return Err(RepositoryError::NotFound(format!("group {}", participant.group_id)));
            }
            Some("ongoing") => {}
            Some(other) => {
                return Err(RepositoryError::BusinessRule(format!(
                    "group {} is {}",
                    participant.group_id, other
                )));
            }
        }

        insert_participant(&mut tx, participant).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_transition(
        &self,
        group: &GroupPurchase,
        transition: &StatusTransition,
        settlement: Option<&SettlementRecord>,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM group_purchases WHERE id = $1 FOR UPDATE")
                .bind(group.id)
                .fetch_optional(&mut *tx)
                .await?;

        match status.as_deref() {
            None => return Err(RepositoryError::NotFound(format!("group {}", group.id))),
            Some("ongoing") => {}
            Some(_) => {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        let tally: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM participants WHERE group_id = $1 AND paid AND NOT is_leader",
        )
        .bind(group.id)
        .fetch_one(&mut *tx)
        .await?;

        let frozen = group.actual_friend_count.unwrap_or_default();
        if tally != i64::from(frozen) {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "group {} has {} paid friends, finalization counted {}",
                group.id, tally, frozen
            )));
        }

        sqlx::query(
            r#"
            UPDATE group_purchases
            SET status = $2, actual_friend_count = $3, finalized_at = $4
            WHERE id = $1 AND status = 'ongoing'
            "#,
        )
        .bind(group.id)
        .bind(group.status.as_str())
        .bind(group.actual_friend_count)
        .bind(group.finalized_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO status_transitions (group_id, from_status, to_status, reason, at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(transition.group_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.reason.as_str())
        .bind(transition.at)
        .execute(&mut *tx)
        .await?;

        if let Some(record) = settlement {
            insert_settlement(&mut tx, record).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn find_transitions(&self, group_id: Uuid) -> RepoResult<Vec<StatusTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT group_id, from_status, to_status, reason, at
            FROM status_transitions
            WHERE group_id = $1
            ORDER BY id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatusTransition::try_from).collect()
    }

    async fn find_expired_ongoing(&self, now: DateTime<Utc>, limit: i64) -> RepoResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM group_purchases
            WHERE status = 'ongoing' AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn find_secondary_of(
        &self,
        source_group_id: Uuid,
        leader_user_id: Uuid,
    ) -> RepoResult<Option<GroupPurchase>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {} FROM group_purchases WHERE source_group_id = $1 AND leader_user_id = $2",
            GROUP_COLUMNS
        ))
        .bind(source_group_id)
        .bind(leader_user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GroupPurchase::try_from).transpose()
    }
}

async fn insert_participant(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    participant: &Participant,
) -> RepoResult<()> {
    sqlx::query(
        r#"
        INSERT INTO participants
            (id, group_id, user_id, is_leader, paid, paid_at, amount_paid,
             payment_reference, consolidate_with_leader, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(participant.id)
    .bind(participant.group_id)
    .bind(participant.user_id)
    .bind(participant.is_leader)
    .bind(participant.paid)
    .bind(participant.paid_at)
    .bind(participant.amount_paid)
    .bind(&participant.payment_reference)
    .bind(participant.consolidate_with_leader)
    .bind(participant.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
