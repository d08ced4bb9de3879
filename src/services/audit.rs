use crate::error::{AppError, AppResult};
use crate::models::{GroupPurchase, Participant, SettlementRecord, StatusTransition, WalletTransaction};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: i64,
    pub event_type: String, // "group_created", "participant_joined", "settlement_dispatched", etc.
    pub group_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub details: serde_json::Value,
}

/// Append-only JSON-lines trail of every money-moving action
pub struct AuditTrailService {
    log_file: PathBuf,
    file_handle: Arc<Mutex<std::fs::File>>,
}

impl AuditTrailService {
    /// Create a new audit trail service
    pub fn new(log_directory: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&log_directory)
            .map_err(|e| AppError::Message(format!("Failed to create log directory: {}", e)))?;

        let date = chrono::Utc::now().format("%Y-%m-%d");
        let log_file = log_directory.join(format!("audit_{}.log", date));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| AppError::Message(format!("Failed to open audit log file: {}", e)))?;

        info!("Audit trail initialized: {:?}", log_file);

        Ok(Self {
            log_file,
            file_handle: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_file
    }

    /// Log an audit entry
    pub async fn log(&self, entry: AuditLogEntry) -> AppResult<()> {
        let json = serde_json::to_string(&entry)?;

        let mut file = self.file_handle.lock().await;
        writeln!(file, "{}", json).map_err(|e| AppError::Message(format!("Failed to write audit log: {}", e)))?;

        file.flush()
            .map_err(|e| AppError::Message(format!("Failed to flush audit log: {}", e)))?;

        Ok(())
    }

    pub async fn log_group_created(&self, group: &GroupPurchase) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: "group_created".to_string(),
            group_id: Some(group.id),
            user_id: Some(group.leader_user_id),
            details: serde_json::json!({
                "kind": group.kind.as_str(),
                "expected_friend_count": group.expected_friend_count,
                "original_basket_price": group.original_basket_price,
                "payment_reference": group.leader_payment_reference,
                "source_group_id": group.source_group_id,
                "expires_at": group.expires_at.to_rfc3339(),
            }),
        };

        self.log(entry).await
    }

    pub async fn log_participant_joined(&self, participant: &Participant) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: "participant_joined".to_string(),
            group_id: Some(participant.group_id),
            user_id: participant.user_id,
            details: serde_json::json!({
                "amount_paid": participant.amount_paid,
                "payment_reference": participant.payment_reference,
                "consolidate_with_leader": participant.consolidate_with_leader,
            }),
        };

        self.log(entry).await
    }

    pub async fn log_group_finalized(
        &self,
        group: &GroupPurchase,
        transition: &StatusTransition,
        settlement: Option<&SettlementRecord>,
    ) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: "group_finalized".to_string(),
            group_id: Some(group.id),
            user_id: Some(group.leader_user_id),
            details: serde_json::json!({
                "from": transition.from.as_str(),
                "to": transition.to.as_str(),
                "reason": transition.reason.as_str(),
                "actual_friend_count": group.actual_friend_count,
                "final_basket_price": settlement.map(|s| s.final_basket_price),
                "consolidation_discount": settlement.map(|s| s.consolidation_discount),
                "delta": settlement.map(|s| s.delta),
            }),
        };

        self.log(entry).await
    }

    /// `card_masked` is only set for bank-card refunds; full numbers never reach the trail
    pub async fn log_settlement_dispatched(
        &self,
        record: &SettlementRecord,
        card_masked: Option<&str>,
    ) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: "settlement_dispatched".to_string(),
            group_id: Some(record.group_id),
            user_id: Some(record.leader_user_id),
            details: serde_json::json!({
                "method": record.method.as_str(),
                "delta": record.delta,
                "wallet_applied": record.wallet_applied,
                "gateway_reference": record.gateway_reference,
                "card": card_masked,
            }),
        };

        self.log(entry).await
    }

    pub async fn log_wallet_refund(
        &self,
        group_id: Option<Uuid>,
        transaction: &WalletTransaction,
        reason: &str,
    ) -> AppResult<()> {
        let entry = AuditLogEntry {
            timestamp: chrono::Utc::now().timestamp(),
            event_type: transaction.kind.as_str().to_string(),
            group_id,
            user_id: Some(transaction.user_id),
            details: serde_json::json!({
                "amount": transaction.amount,
                "balance_after": transaction.balance_after,
                "idempotency_key": transaction.idempotency_key,
                "reason": reason,
            }),
        };

        self.log(entry).await
    }
}

/// Audit writes never fail the money movement they describe
pub(crate) fn report(result: AppResult<()>) {
    if let Err(e) = result {
        warn!("Audit write failed: {}", e);
    }
}
