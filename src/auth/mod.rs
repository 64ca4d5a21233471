//! Authentication: webhook signature verification + dashboard API key.

pub mod api_key;
pub mod signature;

pub use api_key::{require_api_key, ApiKeyError};
pub use signature::SignatureVerifier;
