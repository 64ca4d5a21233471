//! Shopflow Backend Library
//!
//! Webhook ingestion, queueing, and fan-out pipeline for Shopee order
//! events. Exposes the core modules for the receiver and worker binaries
//! and for integration tests.

pub mod api;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod recon;
pub mod runtime_config;
pub mod sink;
pub mod upstream;

pub use config::Settings;
pub use error::{ProcessError, ProcessResult};
