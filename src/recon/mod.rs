//! Reconciliation: periodic sweeps of the upstream API that heal missed or
//! out-of-order webhook events.

pub mod scheduler;
pub mod service;

pub use scheduler::ReconciliationScheduler;
pub use service::{ReconciliationConfig, ReconciliationService, SyncStatus};
