pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod gateways;
pub mod idempotency;
pub mod metrics;
pub mod models;
pub mod reconciler;
pub mod routes;
pub mod store;
pub mod tasks;

pub use coordinator::{ConfirmSource, CoordinatorConfig, PaymentCoordinator};
pub use error::PaymentError;
pub use reconciler::LedgerReconciler;
pub use routes::{payments_router, AppState};
