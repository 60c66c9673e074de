// src/cache.rs
//! Redis-backed shared cache writer. Every write is capped by a short
//! timeout so a wedged cache can never back up the stream tasks; a missed
//! write is logged and the next update overwrites it anyway.

use crate::types::TopNSnapshot;
use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct CacheWriter {
    conn: ConnectionManager,
}

impl CacheWriter {
    /// Connects and pings so a dead cache is caught at startup.
    pub async fn connect(addr: &str, db: i64) -> Result<Self> {
        let url = format!("redis://{}/{}", addr, db);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid cache address {}", url))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .context("cache connect failed")?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("cache ping failed")?;
        Ok(CacheWriter { conn })
    }

    /// Fire-and-forget overwrite with the bounded timeout. Returns whether
    /// the write landed so callers can count failures.
    pub async fn set(&self, key: &str, value: String) -> bool {
        let mut conn = self.conn.clone();
        match timeout(WRITE_TIMEOUT, conn.set::<_, _, ()>(key, value)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("cache write failed for {}: {}", key, e);
                false
            }
            Err(_) => {
                warn!("cache write timed out for {}", key);
                false
            }
        }
    }

    pub async fn publish_top_n(&self, slice: &TopNSnapshot) -> bool {
        let key = format!("OrderBook:{}", slice.symbol);
        match serde_json::to_string(slice) {
            Ok(payload) => self.set(&key, payload).await,
            Err(e) => {
                warn!("failed to serialize top-n slice: {}", e);
                false
            }
        }
    }

    pub async fn set_wallet_balance(&self, balance: String) -> bool {
        self.set("Wallet:USDT", balance).await
    }

    pub async fn set_position(&self, symbol: &str, amount: String) -> bool {
        self.set(&format!("Position:{}", symbol), amount).await
    }

    pub async fn set_entry_price(&self, symbol: &str, entry_price: String) -> bool {
        self.set(&format!("EntryPrice:{}", symbol), entry_price).await
    }
}
