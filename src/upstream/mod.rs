//! Upstream platform API: signed requests, token lifecycle, order assembly.

pub mod client;
pub mod orders;
pub mod tokens;

pub use client::{ApiOrderDetail, OrderListEntry, ShopeeApi, ShopeeClient};
pub use orders::{AssembledOrder, OrderService};
pub use tokens::{StoredTokens, TokenStore};
