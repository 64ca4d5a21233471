//! HTTP surfaces for both binaries.

pub mod dashboard;
pub mod routes;
pub mod worker;

pub use dashboard::{dashboard_router, DashboardState};
pub use routes::{receiver_router, ReceiverState};
pub use worker::{worker_router, WorkerApiState};
