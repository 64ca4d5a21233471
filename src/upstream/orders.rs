//! Order assembly: joins order detail and settlement into sink rows.
//!
//! The two upstream calls run concurrently; a missing settlement is normal
//! (orders settle days after shipping) and zeroes `total_sale` rather than
//! failing the event. The escrow amount is the only ground truth for net
//! income and is distributed pro-rata across items by their share of the
//! settlement merchandise value.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::client::{ApiOrderDetail, ApiOrderItem, ShopeeApi};
use crate::config::PLATFORM_NAME;
use crate::error::{ProcessError, ProcessResult};
use crate::models::{OrderItem, Settlement};

const CURRENCY_DECIMAL_PLACES: i32 = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecipientAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_address: Option<String>,
}

/// Fully assembled order: normalized sink rows plus the display fields the
/// notifier renders.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledOrder {
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<i64>,
    pub buyer: String,
    pub platform: String,
    pub status: String,
    pub create_time: String,
    pub update_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_carrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_address: Option<RecipientAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_amount: Option<f64>,
    pub item_count: usize,
    pub items: Vec<OrderItem>,
}

pub struct OrderService {
    api: Arc<dyn ShopeeApi>,
}

fn round_currency(value: f64) -> f64 {
    let factor = 10f64.powi(CURRENCY_DECIMAL_PLACES);
    (value * factor).round() / factor
}

fn iso_utc(unix: i64) -> String {
    Utc.timestamp_opt(unix, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Pro-rata net income for one item.
///
/// `selling_price` on a settlement line is already the line total, so an
/// item's share of the escrow payout is `selling_price / total_merch`.
/// Unmatched items and zeroed settlements yield 0.0; the per-order sum may
/// miss the escrow amount by rounding pennies, which is accepted.
fn item_net_income(item: &ApiOrderItem, settlement: Option<&Settlement>) -> f64 {
    let Some(settlement) = settlement else {
        debug!("Settlement not available for net income calculation");
        return 0.0;
    };

    if settlement.escrow_amount == 0.0 || settlement.items.is_empty() {
        return 0.0;
    }

    let total_merch: f64 = settlement.items.iter().map(|ei| ei.selling_price).sum();
    if total_merch == 0.0 {
        return 0.0;
    }

    let matched = settlement.items.iter().find(|ei| {
        let model_match = ei
            .model_sku
            .as_deref()
            .filter(|s| !s.is_empty())
            .is_some_and(|s| Some(s) == item.model_sku.as_deref());
        let item_match = ei
            .item_sku
            .as_deref()
            .filter(|s| !s.is_empty())
            .is_some_and(|s| Some(s) == item.item_sku.as_deref());
        model_match || item_match
    });

    let Some(matched) = matched else {
        warn!(
            sku = item.model_sku.as_deref().or(item.item_sku.as_deref()).unwrap_or(""),
            "Could not match item to settlement data"
        );
        return 0.0;
    };

    let ratio = matched.selling_price / total_merch;
    round_currency(settlement.escrow_amount * ratio)
}

fn item_sku(item: &ApiOrderItem) -> String {
    let sku = item
        .model_sku
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or(item.item_sku.as_deref().filter(|s| !s.trim().is_empty()));

    match sku {
        Some(sku) => sku.trim().to_string(),
        None => {
            let name = item.item_name.as_deref().unwrap_or("UNKNOWN_ITEM");
            format!("NO_SKU_{name}").trim().to_string()
        }
    }
}

fn parse_order_items(order: &ApiOrderDetail, settlement: Option<&Settlement>) -> Vec<OrderItem> {
    let order_datetime = iso_utc(order.create_time);

    order
        .item_list
        .iter()
        .map(|item| OrderItem {
            order_id: order.order_sn.clone(),
            date_time: order_datetime.clone(),
            buyer: order.buyer_username.clone().unwrap_or_default(),
            platform: PLATFORM_NAME.to_string(),
            product_name: item.item_name.clone().unwrap_or_default(),
            item_type: item.model_name.clone().unwrap_or_default(),
            parent_sku: item.item_sku.clone().unwrap_or_default(),
            sku: item_sku(item),
            quantity: item.model_quantity_purchased.unwrap_or(1),
            total_sale: item_net_income(item, settlement),
            shopee_status: order.order_status.clone(),
            status: order.order_status.clone(),
        })
        .collect()
}

impl OrderService {
    pub fn new(api: Arc<dyn ShopeeApi>) -> Self {
        Self { api }
    }

    /// Assembles the full detail for one order.
    ///
    /// Order detail and settlement are fetched concurrently; only the order
    /// detail is load-bearing. An API-reported settlement error means the
    /// order has not settled yet and is treated as "no settlement".
    pub async fn fetch_order_details(&self, order_sn: &str) -> ProcessResult<AssembledOrder> {
        info!(order = order_sn, "Fetching order details from API");

        let sn_list = vec![order_sn.to_string()];
        let (detail_result, escrow_result) = tokio::join!(
            self.api.get_order_detail(&sn_list),
            self.api.get_escrow_detail(order_sn),
        );

        let order_list = detail_result?;
        let order = order_list.into_iter().next().ok_or_else(|| {
            ProcessError::upstream(format!("no orders in API response for {order_sn}"))
        })?;

        let settlement = match escrow_result {
            Ok(settlement) => Some(settlement),
            Err(e) => {
                info!(order = order_sn, error = %e, "Escrow data not available, using 0.0 net income");
                None
            }
        };

        info!(
            order = %order.order_sn,
            items = order.item_list.len(),
            "Got order detail"
        );

        let items = parse_order_items(&order, settlement.as_ref());
        Ok(Self::format_order(order, settlement, items))
    }

    fn format_order(
        order: ApiOrderDetail,
        settlement: Option<Settlement>,
        items: Vec<OrderItem>,
    ) -> AssembledOrder {
        let recipient_address = order.recipient_address.map(|addr| RecipientAddress {
            name: addr.name,
            phone: addr.phone,
            city: addr.city,
            district: addr.district,
            state: addr.state,
            full_address: addr.full_address,
        });

        AssembledOrder {
            order_id: order.order_sn,
            shop_id: order.shop_id,
            buyer: order.buyer_username.unwrap_or_default(),
            platform: PLATFORM_NAME.to_string(),
            status: order.order_status,
            create_time: iso_utc(order.create_time),
            update_time: iso_utc(order.update_time),
            total_amount: order.total_amount,
            currency: order.currency,
            payment_method: order.payment_method,
            shipping_carrier: order.shipping_carrier,
            recipient_address,
            escrow_amount: settlement.map(|s| s.escrow_amount),
            item_count: items.len(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettlementItem;

    fn api_item(model_sku: &str, item_sku: &str, name: &str) -> ApiOrderItem {
        ApiOrderItem {
            item_name: Some(name.to_string()),
            item_sku: if item_sku.is_empty() {
                None
            } else {
                Some(item_sku.to_string())
            },
            model_name: Some("variant".to_string()),
            model_sku: if model_sku.is_empty() {
                None
            } else {
                Some(model_sku.to_string())
            },
            model_quantity_purchased: Some(1),
            model_discounted_price: Some(10.0),
        }
    }

    fn settlement(escrow: f64, lines: &[(&str, f64)]) -> Settlement {
        Settlement {
            escrow_amount: escrow,
            items: lines
                .iter()
                .map(|(sku, price)| SettlementItem {
                    item_sku: None,
                    model_sku: Some(sku.to_string()),
                    selling_price: *price,
                    quantity_purchased: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn pro_rata_splits_escrow_by_merchandise_share() {
        let s = settlement(100.0, &[("X", 60.0), ("Y", 40.0)]);

        let x = item_net_income(&api_item("X", "", "a"), Some(&s));
        let y = item_net_income(&api_item("Y", "", "b"), Some(&s));

        assert_eq!(x, 60.0);
        assert_eq!(y, 40.0);
    }

    #[test]
    fn pro_rata_conservation_within_rounding() {
        let s = settlement(10.0, &[("A", 1.0), ("B", 1.0), ("C", 1.0)]);

        let total: f64 = ["A", "B", "C"]
            .iter()
            .map(|sku| item_net_income(&api_item(sku, "", "x"), Some(&s)))
            .sum();

        // Each matched item may drift by at most a cent.
        assert!((total - 10.0).abs() <= 3.0 * 0.01 + f64::EPSILON);
    }

    #[test]
    fn zero_escrow_and_missing_settlement_yield_zero() {
        let zero = settlement(0.0, &[("X", 60.0)]);
        assert_eq!(item_net_income(&api_item("X", "", "a"), Some(&zero)), 0.0);
        assert_eq!(item_net_income(&api_item("X", "", "a"), None), 0.0);
    }

    #[test]
    fn unmatched_item_yields_zero() {
        let s = settlement(100.0, &[("X", 60.0)]);
        assert_eq!(item_net_income(&api_item("Z", "", "a"), Some(&s)), 0.0);
    }

    #[test]
    fn matches_by_item_sku_when_model_sku_absent() {
        let s = Settlement {
            escrow_amount: 50.0,
            items: vec![SettlementItem {
                item_sku: Some("PARENT".to_string()),
                model_sku: None,
                selling_price: 50.0,
                quantity_purchased: 1,
            }],
        };

        assert_eq!(item_net_income(&api_item("", "PARENT", "a"), Some(&s)), 50.0);
    }

    #[test]
    fn sku_falls_back_to_product_name() {
        assert_eq!(item_sku(&api_item("", "", "Widget")), "NO_SKU_Widget");
        assert_eq!(item_sku(&api_item("M1", "P1", "Widget")), "M1");
        assert_eq!(item_sku(&api_item("", "P1", "Widget")), "P1");
    }

    #[test]
    fn parse_items_builds_sink_rows() {
        let order = ApiOrderDetail {
            order_sn: "A1".to_string(),
            shop_id: Some(10),
            buyer_username: Some("buyer1".to_string()),
            order_status: "READY_TO_SHIP".to_string(),
            create_time: 1704337899,
            update_time: 1704337899,
            total_amount: Some(100.0),
            currency: Some("SGD".to_string()),
            payment_method: None,
            shipping_carrier: None,
            item_list: vec![api_item("X", "P", "Widget"), api_item("Y", "P", "Gadget")],
            recipient_address: None,
        };
        let s = settlement(100.0, &[("X", 60.0), ("Y", 40.0)]);

        let items = parse_order_items(&order, Some(&s));

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].order_id, "A1");
        assert_eq!(items[0].platform, PLATFORM_NAME);
        assert_eq!(items[0].sku, "X");
        assert_eq!(items[0].total_sale, 60.0);
        assert_eq!(items[1].total_sale, 40.0);
        assert_eq!(items[0].date_time, "2024-01-04T03:11:39");
        assert_eq!(items[0].shopee_status, "READY_TO_SHIP");
    }

    #[test]
    fn rounding_is_two_decimal_places() {
        let s = settlement(10.0, &[("A", 1.0), ("B", 2.0)]);
        // 10 * (1/3) = 3.333... -> 3.33
        assert_eq!(item_net_income(&api_item("A", "", "x"), Some(&s)), 3.33);
        // 10 * (2/3) = 6.666... -> 6.67
        assert_eq!(item_net_income(&api_item("B", "", "x"), Some(&s)), 6.67);
    }
}
