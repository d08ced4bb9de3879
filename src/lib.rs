//! Group Buy Engine Library
//!
//! This module exposes the engine components for use by tests and other consumers.

pub mod auth;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod locks;
pub mod models;
pub mod pricing;
pub mod repositories;
pub mod services;
pub mod sweeper;
pub mod websocket;

// Re-export commonly used types
pub use auth::{Identity, Session};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, EngineConfig};
pub use engine::{EngineBuilder, GroupPurchaseEngine, GroupView, Stores};
pub use error::{AppError, AppResult, ErrorKind};
pub use events::{DomainEvent, EventBus};
pub use models::*;
