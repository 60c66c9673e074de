// src/rest.rs
//! One-shot REST calls against the futures venue: the public full-depth
//! snapshot and the signed private endpoints (balance, position risk,
//! listen key, order entry). Retry policy lives with the callers.

use crate::types::{
    now_ms, DepthSnapshot, FuturesBalance, ListenKeyResponse, OrderRequest, PositionRisk,
};
use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const REST_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_WINDOW_MS: u64 = 5_000;

/// Pulls the full order-book snapshot. No retries here; the sync
/// coordinator owns backoff.
pub async fn fetch_depth_snapshot(
    http: &Client,
    base_url: &str,
    symbol: &str,
    limit: u32,
) -> Result<DepthSnapshot> {
    let url = format!(
        "{}/fapi/v1/depth?symbol={}&limit={}",
        base_url.trim_end_matches('/'),
        symbol,
        limit
    );
    let resp = http
        .get(&url)
        .timeout(REST_TIMEOUT)
        .send()
        .await
        .context("depth snapshot request failed")?
        .error_for_status()
        .context("depth snapshot rejected")?;
    resp.json::<DepthSnapshot>()
        .await
        .context("failed to decode depth snapshot")
}

pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signed REST client for the private endpoints.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    http: Client,
    timestamp_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        ApiClient {
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            http,
            timestamp_fn: Arc::new(now_ms),
        }
    }

    /// Swap the timestamp source; lets tests pin the signature.
    pub fn with_timestamp_fn(mut self, f: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.timestamp_fn = f;
        self
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Canonical query string: timestamp + recvWindow appended, keys
    /// sorted, then the HMAC-SHA256 signature tacked on the end. The
    /// signed string and the sent string must be byte-identical.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".to_string(), (self.timestamp_fn)().to_string()));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign_query(&self.api_secret, &canonical);
        format!("{}&signature={}", canonical, signature)
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Response> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url.trim_end_matches('/'), path, query);
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("venue error {} on {}: {}", status, path, body);
        }
        Ok(resp)
    }

    /// Wallet balance of the USDT asset, as the venue's decimal string.
    pub async fn fetch_usdt_balance(&self) -> Result<String> {
        let rows: Vec<FuturesBalance> = self
            .send_signed(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?
            .json()
            .await
            .context("failed to decode balance response")?;
        rows.into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.balance)
            .context("USDT asset missing from balance response")
    }

    /// Position amount and entry price for the symbol. A flat account
    /// reports zeros.
    pub async fn fetch_position(&self, symbol: &str) -> Result<(String, String)> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let rows: Vec<PositionRisk> = self
            .send_signed(Method::GET, "/fapi/v2/positionRisk", params)
            .await?
            .json()
            .await
            .context("failed to decode position risk response")?;
        Ok(rows
            .into_iter()
            .next()
            .map(|p| (p.position_amt, p.entry_price))
            .unwrap_or_else(|| ("0".to_string(), "0".to_string())))
    }

    /// Mints the user-data stream token. Key-only auth, no signature.
    pub async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("listen key request failed")?
            .error_for_status()
            .context("listen key rejected")?;
        let parsed: ListenKeyResponse = resp
            .json()
            .await
            .context("failed to decode listen key response")?;
        Ok(parsed.listen_key)
    }

    /// Extends the token's lifetime; the venue expires idle keys.
    pub async fn renew_listen_key(&self, key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url.trim_end_matches('/'));
        self.http
            .put(&url)
            .query(&[("listenKey", key)])
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("listen key renewal failed")?
            .error_for_status()
            .context("listen key renewal rejected")?;
        Ok(())
    }

    pub async fn place_order(&self, req: &OrderRequest) -> Result<serde_json::Value> {
        let mut params = vec![
            ("symbol".to_string(), req.symbol.clone()),
            ("side".to_string(), req.side.clone()),
            ("type".to_string(), req.order_type.clone()),
            ("quantity".to_string(), format!("{}", req.quantity)),
        ];
        if req.order_type == "LIMIT" {
            params.push(("price".to_string(), format!("{}", req.price)));
            params.push(("timeInForce".to_string(), req.time_in_force.clone()));
        }
        if !req.new_client_order_id.is_empty() {
            params.push(("newClientOrderId".to_string(), req.new_client_order_id.clone()));
        }
        self.send_signed(Method::POST, "/fapi/v1/order", params)
            .await?
            .json()
            .await
            .context("failed to decode order response")
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        orig_client_order_id: &str,
    ) -> Result<serde_json::Value> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("origClientOrderId".to_string(), orig_client_order_id.to_string()),
        ];
        self.send_signed(Method::DELETE, "/fapi/v1/order", params)
            .await?
            .json()
            .await
            .context("failed to decode cancel response")
    }
}
