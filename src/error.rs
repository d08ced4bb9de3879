use crate::database::DatabaseError;
use crate::models::GroupStatus;
use sqlx::Error as SqlxError;
use thiserror::Error;
use uuid::Uuid;

/// Application-level error types
///
/// Every variant maps to a stable [`ErrorKind`] so callers can translate
/// rejections into localized text without parsing messages.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Group {0} not found")]
    GroupNotFound(Uuid),

    #[error("Group {0} has expired")]
    GroupExpired(Uuid),

    #[error("Group {group_id} is no longer ongoing (status: {status})")]
    GroupNotOngoing { group_id: Uuid, status: GroupStatus },

    #[error("Group {0} has no paid friends yet")]
    InsufficientFriends(Uuid),

    #[error("Group {0} is already full")]
    GroupFull(Uuid),

    #[error("User {user_id} already joined group {group_id}")]
    AlreadyJoined { group_id: Uuid, user_id: Uuid },

    #[error("Settlement for group {0} not found")]
    SettlementNotFound(Uuid),

    #[error("Settlement for group {0} is already settled or in progress")]
    DuplicateSettlement(Uuid),

    #[error("No refund is due for group {0}")]
    RefundNotApplicable(Uuid),

    #[error("Secondary group not allowed: {0}")]
    SecondaryGroupNotAllowed(String),

    #[error("Invalid card number")]
    InvalidCardNumber,

    #[error("Payment not confirmed: {0}")]
    PaymentNotConfirmed(String),

    /// Retryable: the gateway could not be reached or answered with a server error
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Wallet credit failed: {0}")]
    WalletCreditFailed(String),

    #[error("Invalid pricing tier: {0}")]
    InvalidPricingTier(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database errors
    #[error("SQL error: {0}")]
    Sqlx(#[from] SqlxError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Business logic error: {0}")]
    BusinessLogic(String),

    /// External service errors (catalog, non-payment collaborators)
    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Message(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Stable error codes exposed to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    GroupNotFound,
    GroupExpired,
    GroupNotOngoing,
    InsufficientFriends,
    GroupFull,
    AlreadyJoined,
    SettlementNotFound,
    DuplicateSettlement,
    RefundNotApplicable,
    SecondaryGroupNotAllowed,
    InvalidCardNumber,
    PaymentNotConfirmed,
    GatewayUnavailable,
    WalletCreditFailed,
    InvalidPricingTier,
    Unauthenticated,
    Unauthorized,
    Validation,
    NotFound,
    BusinessLogic,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::GroupNotFound => "group_not_found",
            ErrorKind::GroupExpired => "group_expired",
            ErrorKind::GroupNotOngoing => "group_not_ongoing",
            ErrorKind::InsufficientFriends => "insufficient_friends",
            ErrorKind::GroupFull => "group_full",
            ErrorKind::AlreadyJoined => "already_joined",
            ErrorKind::SettlementNotFound => "settlement_not_found",
            ErrorKind::DuplicateSettlement => "duplicate_settlement",
            ErrorKind::RefundNotApplicable => "refund_not_applicable",
            ErrorKind::SecondaryGroupNotAllowed => "secondary_group_not_allowed",
            ErrorKind::InvalidCardNumber => "invalid_card_number",
            ErrorKind::PaymentNotConfirmed => "payment_not_confirmed",
            ErrorKind::GatewayUnavailable => "gateway_unavailable",
            ErrorKind::WalletCreditFailed => "wallet_credit_failed",
            ErrorKind::InvalidPricingTier => "invalid_pricing_tier",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BusinessLogic => "business_logic",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    /// Stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::GroupNotFound(_) => ErrorKind::GroupNotFound,
            AppError::GroupExpired(_) => ErrorKind::GroupExpired,
            AppError::GroupNotOngoing { .. } => ErrorKind::GroupNotOngoing,
            AppError::InsufficientFriends(_) => ErrorKind::InsufficientFriends,
            AppError::GroupFull(_) => ErrorKind::GroupFull,
            AppError::AlreadyJoined { .. } => ErrorKind::AlreadyJoined,
            AppError::SettlementNotFound(_) => ErrorKind::SettlementNotFound,
            AppError::DuplicateSettlement(_) => ErrorKind::DuplicateSettlement,
            AppError::RefundNotApplicable(_) => ErrorKind::RefundNotApplicable,
            AppError::SecondaryGroupNotAllowed(_) => ErrorKind::SecondaryGroupNotAllowed,
            AppError::InvalidCardNumber => ErrorKind::InvalidCardNumber,
            AppError::PaymentNotConfirmed(_) => ErrorKind::PaymentNotConfirmed,
            AppError::GatewayUnavailable(_) => ErrorKind::GatewayUnavailable,
            AppError::WalletCreditFailed(_) => ErrorKind::WalletCreditFailed,
            AppError::InvalidPricingTier(_) => ErrorKind::InvalidPricingTier,
            AppError::Unauthenticated => ErrorKind::Unauthenticated,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::BusinessLogic(_) => ErrorKind::BusinessLogic,
            AppError::Database(_)
            | AppError::Sqlx(_)
            | AppError::Config(_)
            | AppError::ExternalService(_)
            | AppError::Serialization(_)
            | AppError::Message(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is a database connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AppError::Database(DatabaseError::PoolCreation(_))
                | AppError::Database(DatabaseError::ConnectionTimeout)
        )
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::GatewayUnavailable(_) | AppError::ExternalService(_)
        ) || self.is_connection_error()
    }

    /// Check if error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_) | AppError::GroupNotFound(_) | AppError::SettlementNotFound(_)
        )
    }

    /// HTTP-like status for callers that front the engine with an API
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::GroupNotFound | ErrorKind::SettlementNotFound | ErrorKind::NotFound => 404,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Unauthorized => 403,
            ErrorKind::Validation | ErrorKind::InvalidCardNumber | ErrorKind::InvalidPricingTier => 400,
            ErrorKind::GroupExpired
            | ErrorKind::GroupNotOngoing
            | ErrorKind::InsufficientFriends
            | ErrorKind::GroupFull
            | ErrorKind::AlreadyJoined
            | ErrorKind::DuplicateSettlement
            | ErrorKind::RefundNotApplicable
            | ErrorKind::SecondaryGroupNotAllowed
            | ErrorKind::BusinessLogic => 409,
            ErrorKind::PaymentNotConfirmed => 402,
            ErrorKind::GatewayUnavailable => 503,
            ErrorKind::WalletCreditFailed | ErrorKind::Internal => 500,
        }
    }
}

/// Repository-specific error types
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database query error
    #[error("Query error: {0}")]
    Query(SqlxError),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Duplicate record
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Business rule violation (e.g., insufficient balance)
    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    /// Stored row could not be mapped back to a domain value
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Conditional write lost a race (stale version or changed tally)
    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(msg) => AppError::NotFound(msg),
            RepositoryError::Query(e) => AppError::Sqlx(e),
            RepositoryError::Duplicate(msg) => AppError::BusinessLogic(format!("Duplicate: {}", msg)),
            RepositoryError::ConstraintViolation(msg) => AppError::Validation(msg),
            RepositoryError::InvalidInput(msg) => AppError::Validation(msg),
            RepositoryError::BusinessRule(msg) => AppError::BusinessLogic(msg),
            RepositoryError::Corrupt(msg) => AppError::Message(format!("Corrupt row: {}", msg)),
            RepositoryError::Conflict(msg) => AppError::BusinessLogic(format!("Conflict: {}", msg)),
        }
    }
}

impl From<SqlxError> for RepositoryError {
    fn from(err: SqlxError) -> Self {
        match &err {
            SqlxError::RowNotFound => RepositoryError::NotFound("Record not found".to_string()),
            SqlxError::Database(db_err) => {
                // Check for common PostgreSQL error codes
                let code = db_err.code().map(|c| c.to_string());
                if code.as_deref() == Some("23505") {
                    // Unique violation
                    RepositoryError::Duplicate(db_err.message().to_string())
                } else if code.as_deref() == Some("23503") || code.as_deref() == Some("23514") {
                    // Foreign key / check constraint violation
                    RepositoryError::ConstraintViolation(db_err.message().to_string())
                } else {
                    RepositoryError::Query(err)
                }
            }
            _ => RepositoryError::Query(err),
        }
    }
}

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepositoryError>;
