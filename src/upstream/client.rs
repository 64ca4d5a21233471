//! Shopee Open Platform API client.
//!
//! Every authenticated GET carries `partner_id, timestamp, access_token,
//! shop_id, sign` where `sign = HMAC-SHA256(partner_key, partner_id || path
//! || timestamp || access_token || shop_id)` hex-encoded. Token refresh signs
//! without the access token and is single-flighted so concurrent callers
//! never race two refreshes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use super::tokens::{now_unix, StoredTokens, TokenStore};
use crate::error::{ProcessError, ProcessResult};
use crate::models::{Settlement, SettlementItem};

type HmacSha256 = Hmac<Sha256>;

const GET_ORDER_DETAIL: &str = "/api/v2/order/get_order_detail";
const GET_ESCROW_DETAIL: &str = "/api/v2/payment/get_escrow_detail";
const GET_ORDER_LIST: &str = "/api/v2/order/get_order_list";
const REFRESH_TOKEN_PATH: &str = "/api/v2/auth/access_token/get";

const ORDER_OPTIONAL_FIELDS: &str =
    "buyer_username,item_list,total_amount,order_status,order_income,create_time";

/// Upstream token lifetime when the refresh response omits `expire_in`.
const TOKEN_EXPIRATION_DEFAULT: i64 = 7200;

/// Order list pagination page size (upstream maximum is 100).
const ORDER_LIST_PAGE_SIZE: u32 = 100;
const ORDER_LIST_MAX_PAGES: u32 = 200;

/// One entry of the order list response; carries enough for the
/// reconciliation ignore-status skip without a detail fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderListEntry {
    pub order_sn: String,
    #[serde(default)]
    pub order_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiRecipientAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub full_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiOrderItem {
    #[serde(default)]
    pub item_name: Option<String>,
    #[serde(default)]
    pub item_sku: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_sku: Option<String>,
    #[serde(default)]
    pub model_quantity_purchased: Option<i64>,
    #[serde(default)]
    pub model_discounted_price: Option<f64>,
}

/// Order detail as returned by the upstream order API. Decoding is tolerant;
/// the platform adds fields without notice.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrderDetail {
    pub order_sn: String,
    #[serde(default)]
    pub shop_id: Option<i64>,
    #[serde(default)]
    pub buyer_username: Option<String>,
    #[serde(default)]
    pub order_status: String,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub shipping_carrier: Option<String>,
    #[serde(default)]
    pub item_list: Vec<ApiOrderItem>,
    #[serde(default)]
    pub recipient_address: Option<ApiRecipientAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderDetailData {
    #[serde(default)]
    order_list: Vec<ApiOrderDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderListData {
    #[serde(default)]
    order_list: Vec<OrderListEntry>,
    #[serde(default)]
    more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderIncomeData {
    #[serde(default)]
    order_income: OrderIncome,
}

#[derive(Debug, Default, Deserialize)]
struct OrderIncome {
    #[serde(default)]
    escrow_amount: f64,
    #[serde(default)]
    items: Vec<SettlementItem>,
}

/// Seam for the order assembler and reconciliation: production uses
/// [`ShopeeClient`], tests substitute a scripted double.
#[async_trait]
pub trait ShopeeApi: Send + Sync {
    async fn get_order_detail(&self, order_sn_list: &[String]) -> ProcessResult<Vec<ApiOrderDetail>>;

    async fn get_escrow_detail(&self, order_sn: &str) -> ProcessResult<Settlement>;

    async fn get_order_list(
        &self,
        time_from: i64,
        time_to: i64,
    ) -> ProcessResult<Vec<OrderListEntry>>;
}

pub struct ShopeeClient {
    partner_id: i64,
    partner_key: String,
    shop_id: i64,
    host_api: String,
    client: Client,
    tokens: Arc<TokenStore>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ShopeeClient {
    pub fn new(
        partner_id: i64,
        partner_key: String,
        shop_id: i64,
        access_token: String,
        refresh_token: Option<String>,
        host_api: String,
        tokens: Arc<TokenStore>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        if tokens.load().is_some() {
            info!("Loaded tokens from storage");
        } else {
            // First boot: seed the store from the environment with an
            // already-passed expiry so the first call refreshes.
            tokens.save(&StoredTokens {
                access_token,
                refresh_token,
                access_token_expires_at: now_unix(),
            });
            info!("Initialized tokens from environment");
        }

        Ok(Self {
            partner_id,
            partner_key,
            shop_id,
            host_api,
            client,
            tokens,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn sign(&self, path: &str, timestamp: i64, access_token: Option<&str>) -> String {
        let base = match access_token {
            Some(token) => format!(
                "{}{}{}{}{}",
                self.partner_id, path, timestamp, token, self.shop_id
            ),
            None => format!("{}{}{}", self.partner_id, path, timestamp),
        };

        let mut mac = HmacSha256::new_from_slice(self.partner_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(base.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Refreshes the access token and persists the new record.
    async fn refresh_access_token(&self, refresh_token: &str) -> ProcessResult<StoredTokens> {
        info!("Attempting to refresh access token");

        let timestamp = Utc::now().timestamp();
        let sign = self.sign(REFRESH_TOKEN_PATH, timestamp, None);
        let url = format!(
            "{}{}?partner_id={}&timestamp={}&sign={}",
            self.host_api, REFRESH_TOKEN_PATH, self.partner_id, timestamp, sign
        );

        let payload = json!({
            "refresh_token": refresh_token,
            "partner_id": self.partner_id,
            "shop_id": self.shop_id,
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessError::Transport(format!(
                "token refresh HTTP {status}: {body}"
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ProcessError::Transport(format!("token refresh decode: {e}")))?;

        // The refresh endpoint sometimes nests the tokens under `response`
        // and sometimes returns them flat.
        let record = data.get("response").unwrap_or(&data);

        let (Some(access_token), Some(new_refresh)) = (
            record.get("access_token").and_then(|v| v.as_str()),
            record.get("refresh_token").and_then(|v| v.as_str()),
        ) else {
            return Err(ProcessError::upstream(format!(
                "token refresh response missing tokens: {data}"
            )));
        };

        let expire_in = record
            .get("expire_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(TOKEN_EXPIRATION_DEFAULT);

        let tokens = StoredTokens {
            access_token: access_token.to_string(),
            refresh_token: Some(new_refresh.to_string()),
            access_token_expires_at: now_unix() + expire_in as f64,
        };
        self.tokens.save(&tokens);

        info!("Access token refreshed successfully");
        Ok(tokens)
    }

    /// Returns a valid access token, refreshing it first when the stored one
    /// is inside the expiry skew. Concurrent callers single-flight on the
    /// refresh lock and observe the refreshed record after re-checking.
    async fn ensure_valid_token(&self) -> ProcessResult<String> {
        let stored = self
            .tokens
            .load()
            .ok_or_else(|| ProcessError::validation("no tokens in storage"))?;

        if !stored.is_expired() {
            return Ok(stored.access_token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while this one waited.
        if let Some(current) = self.tokens.load() {
            if !current.is_expired() {
                return Ok(current.access_token);
            }

            let refresh_token = current
                .refresh_token
                .ok_or_else(|| ProcessError::validation("no refresh token available"))?;

            info!("Token expired, refreshing");
            let refreshed = self.refresh_access_token(&refresh_token).await?;
            return Ok(refreshed.access_token);
        }

        Err(ProcessError::validation("no tokens in storage"))
    }

    /// Signed GET. API-level errors (`message == "error"` or a non-empty
    /// `error` field) surface as domain failures, distinct from transport.
    async fn make_request(&self, path: &str, params: &[(&str, String)]) -> ProcessResult<Value> {
        let access_token = self.ensure_valid_token().await?;

        let timestamp = Utc::now().timestamp();
        let sign = self.sign(path, timestamp, Some(&access_token));
        debug!(path, sign_prefix = &sign[..16], "Generated request signature");

        let url = format!("{}{}", self.host_api, path);
        let mut query: Vec<(&str, String)> = vec![
            ("partner_id", self.partner_id.to_string()),
            ("timestamp", timestamp.to_string()),
            ("access_token", access_token),
            ("shop_id", self.shop_id.to_string()),
            ("sign", sign),
        ];
        query.extend(params.iter().cloned());

        info!(path, "Making API request");
        let response = self.client.get(&url).query(&query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(path, %status, "HTTP error calling upstream API");
            return Err(ProcessError::Transport(format!("HTTP {status}: {body}")));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ProcessError::Transport(format!("response decode: {e}")))?;

        let message = data.get("message").and_then(|v| v.as_str()).unwrap_or("");
        let api_error = data.get("error").and_then(|v| v.as_str()).unwrap_or("");
        if message == "error" || !api_error.is_empty() {
            warn!(path, message, api_error, "Upstream API returned an error");
            return Err(ProcessError::upstream(format!(
                "{path}: {api_error} {message}"
            )));
        }

        Ok(data)
    }

    fn decode_response<T: serde::de::DeserializeOwned + Default>(data: Value) -> T {
        data.get("response")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ShopeeApi for ShopeeClient {
    /// Fetches order details (max 50 SNs per call).
    async fn get_order_detail(&self, order_sn_list: &[String]) -> ProcessResult<Vec<ApiOrderDetail>> {
        let params = [
            ("order_sn_list", order_sn_list.join(",")),
            ("response_optional_fields", ORDER_OPTIONAL_FIELDS.to_string()),
        ];

        let data = self.make_request(GET_ORDER_DETAIL, &params).await?;
        let decoded: OrderDetailData = Self::decode_response(data);
        Ok(decoded.order_list)
    }

    /// Fetches escrow/settlement figures for a single order.
    async fn get_escrow_detail(&self, order_sn: &str) -> ProcessResult<Settlement> {
        let params = [("order_sn", order_sn.to_string())];

        let data = self.make_request(GET_ESCROW_DETAIL, &params).await?;
        let decoded: OrderIncomeData = Self::decode_response(data);
        Ok(Settlement {
            escrow_amount: decoded.order_income.escrow_amount,
            items: decoded.order_income.items,
        })
    }

    /// Lists orders whose `update_time` falls in `[time_from, time_to]`,
    /// following the cursor until the upstream reports no more pages.
    async fn get_order_list(
        &self,
        time_from: i64,
        time_to: i64,
    ) -> ProcessResult<Vec<OrderListEntry>> {
        let mut entries = Vec::new();
        let mut cursor = String::new();

        for page in 0..ORDER_LIST_MAX_PAGES {
            let mut params = vec![
                ("time_range_field", "update_time".to_string()),
                ("time_from", time_from.to_string()),
                ("time_to", time_to.to_string()),
                ("page_size", ORDER_LIST_PAGE_SIZE.to_string()),
                ("response_optional_fields", "order_status".to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }

            let data = self.make_request(GET_ORDER_LIST, &params).await?;
            let decoded: OrderListData = Self::decode_response(data);
            let more = decoded.more;
            entries.extend(decoded.order_list);

            match decoded.next_cursor {
                Some(next) if more && !next.is_empty() => cursor = next,
                _ => break,
            }

            if page + 1 == ORDER_LIST_MAX_PAGES {
                warn!(time_from, time_to, "Order list pagination hit page cap");
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_hmac(key: &str, base: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(base.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn test_client() -> (tempfile::TempDir, ShopeeClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
        let client = ShopeeClient::new(
            123,
            "partner-secret".into(),
            456,
            "token".into(),
            Some("refresh".into()),
            "https://example.invalid".into(),
            store,
        )
        .unwrap();
        (dir, client)
    }

    #[test]
    fn authenticated_sign_includes_access_token() {
        let (_dir, client) = test_client();
        let sign = client.sign("/api/v2/order/get_order_detail", 1700000000, Some("tok"));
        let expected = hex_hmac(
            "partner-secret",
            "123/api/v2/order/get_order_detail1700000000tok456",
        );
        assert_eq!(sign, expected);
    }

    #[test]
    fn refresh_sign_omits_access_token_and_shop_id() {
        let (_dir, client) = test_client();
        let sign = client.sign(REFRESH_TOKEN_PATH, 1700000000, None);
        let expected = hex_hmac("partner-secret", "123/api/v2/auth/access_token/get1700000000");
        assert_eq!(sign, expected);
    }

    #[test]
    fn decode_response_handles_missing_envelope() {
        let decoded: OrderDetailData =
            ShopeeClient::decode_response(serde_json::json!({"message": "ok"}));
        assert!(decoded.order_list.is_empty());

        let decoded: OrderDetailData = ShopeeClient::decode_response(serde_json::json!({
            "response": {"order_list": [{"order_sn": "A1", "order_status": "SHIPPED"}]}
        }));
        assert_eq!(decoded.order_list.len(), 1);
        assert_eq!(decoded.order_list[0].order_sn, "A1");
    }
}
