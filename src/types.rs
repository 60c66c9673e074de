// src/types.rs
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Incremental depth frame from the futures stream. Field keys follow the
/// venue's single-letter wire encoding.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DepthEvent {
    #[serde(rename = "e", default)]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    #[serde(rename = "pu", default)]
    pub prev_final_update_id: i64,
    #[serde(rename = "b", default)]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    pub asks: Vec<[String; 2]>,
}

/// Full-depth snapshot from `GET /fapi/v1/depth`.
#[derive(Clone, Debug, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// One price level of the published slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub qty: Decimal,
}

/// The top-N slice written to the shared cache. Strategy readers compare
/// `u` across reads to detect whether the slice moved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopNSnapshot {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "u")]
    pub last_update_id: i64,
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "b")]
    pub bids: Vec<PriceLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<PriceLevel>,
}

/// Private user-data frame. Only `ACCOUNT_UPDATE` carries the payload the
/// gateway mirrors; other event types are ignored upstream.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserDataEvent {
    #[serde(rename = "e", default)]
    pub event_type: String,
    #[serde(rename = "a", default)]
    pub account: AccountPayload,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AccountPayload {
    #[serde(rename = "B", default)]
    pub balances: Vec<BalanceUpdate>,
    #[serde(rename = "P", default)]
    pub positions: Vec<PositionUpdate>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BalanceUpdate {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PositionUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa")]
    pub amount: String,
    #[serde(rename = "ep")]
    pub entry_price: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

/// One row of `GET /fapi/v2/balance`.
#[derive(Clone, Debug, Deserialize)]
pub struct FuturesBalance {
    pub asset: String,
    pub balance: String,
}

/// One row of `GET /fapi/v2/positionRisk`.
#[derive(Clone, Debug, Deserialize)]
pub struct PositionRisk {
    #[serde(rename = "positionAmt")]
    pub position_amt: String,
    #[serde(rename = "entryPrice")]
    pub entry_price: String,
}

/// Parameters for `POST /fapi/v1/order`.
#[derive(Clone, Debug)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: f64,
    pub time_in_force: String,
    pub new_client_order_id: String,
}
