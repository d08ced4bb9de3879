pub mod audit;
pub mod dispatcher;
pub mod finalization;
pub mod group_service;
pub mod join_service;
pub mod settlement;

pub use audit::AuditTrailService;
pub use dispatcher::Dispatcher;
pub use finalization::{FinalizationOutcome, FinalizationService, SweepReport};
pub use group_service::{CheckoutQuote, CheckoutRequest, CheckoutSession, GroupService, SecondaryGroupRequest};
pub use join_service::{JoinQuote, JoinService, JoinSession};
pub use settlement::{ProjectedSettlement, SettlementCalculator};
