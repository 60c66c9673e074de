// src/ingest/user_stream.rs
//! Private user-data pipeline: the listen-key websocket mirrors
//! `ACCOUNT_UPDATE` frames into the cache the moment they arrive, and a
//! periodic REST reconciliation overwrites the same keys so a silently
//! dropped frame can never drift the mirror for long.

use crate::cache::CacheWriter;
use crate::rest::ApiClient;
use crate::types::UserDataEvent;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(3);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const KEEPALIVE_PING: Duration = Duration::from_secs(60);
const LISTEN_KEY_RENEWAL: Duration = Duration::from_secs(30 * 60);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Runs the user-data websocket until shutdown. Mints a fresh listen key
/// per connection, renews it on a timer while connected, and reconnects
/// with exponential backoff that resets after a successful connect.
pub async fn run_user_stream(
    api: Arc<ApiClient>,
    cache: CacheWriter,
    symbol: String,
    ws_base: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_BASE;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let listen_key = match api.create_listen_key().await {
            Ok(k) => k,
            Err(e) => {
                warn!("listen key request failed: {:?}", e);
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        let url = format!("{}/ws/{}", ws_base.trim_end_matches('/'), listen_key);
        info!("connecting user-data stream");

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _resp)) => {
                info!("user-data stream connected");
                backoff = BACKOFF_BASE;
                let (mut write, mut read) = ws_stream.split();

                let mut ping_interval = tokio::time::interval(KEEPALIVE_PING);
                let mut renew_interval = tokio::time::interval(LISTEN_KEY_RENEWAL);
                // Both intervals fire immediately on creation; eat that.
                ping_interval.tick().await;
                renew_interval.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            info!("user-data stream closed for shutdown");
                            return;
                        }
                        _ = ping_interval.tick() => {
                            if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                                warn!("user-data ping failed: {:?}", e);
                                break;
                            }
                        }
                        _ = renew_interval.tick() => {
                            // A failed renewal is retried next tick; the
                            // venue grace period is far longer than one.
                            if let Err(e) = api.renew_listen_key(&listen_key).await {
                                warn!("listen key renewal failed: {:?}", e);
                            } else {
                                debug!("listen key renewed");
                            }
                        }
                        msg_opt = read.next() => {
                            let Some(msg) = msg_opt else {
                                warn!("user-data stream ended, reconnecting");
                                break;
                            };
                            match msg {
                                Ok(Message::Text(txt)) => {
                                    handle_user_frame(&txt, &symbol, &cache).await;
                                }
                                Ok(Message::Ping(payload)) => {
                                    if let Err(e) = write.send(Message::Pong(payload)).await {
                                        warn!("user-data pong failed: {:?}", e);
                                        break;
                                    }
                                }
                                Ok(Message::Close(frame)) => {
                                    warn!("user-data close received: {:?}", frame);
                                    break;
                                }
                                Err(e) => {
                                    warn!("user-data recv error: {:?}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("failed to connect user-data stream: {:?}", e);
            }
        }

        if sleep_or_shutdown(backoff, &mut shutdown).await {
            return;
        }
        backoff = next_backoff(backoff);
    }
}

/// Periodic authoritative refresh: balance and position pulled over REST
/// and written over whatever the stream last said. A failed cycle is
/// skipped; the next one retries.
pub async fn run_reconciliation(
    api: Arc<ApiClient>,
    cache: CacheWriter,
    symbol: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                reconcile_once(&api, &cache, &symbol).await;
            }
        }
    }
}

pub async fn reconcile_once(api: &ApiClient, cache: &CacheWriter, symbol: &str) {
    match api.fetch_usdt_balance().await {
        Ok(balance) => {
            cache.set_wallet_balance(balance).await;
        }
        Err(e) => warn!("balance reconciliation failed: {:?}", e),
    }
    match api.fetch_position(symbol).await {
        Ok((amount, entry_price)) => {
            cache.set_position(symbol, amount).await;
            cache.set_entry_price(symbol, entry_price).await;
        }
        Err(e) => warn!("position reconciliation failed: {:?}", e),
    }
}

async fn handle_user_frame(txt: &str, symbol: &str, cache: &CacheWriter) {
    let event = match serde_json::from_str::<UserDataEvent>(txt) {
        Ok(e) => e,
        Err(e) => {
            warn!("user-data frame decode error: {}", e);
            return;
        }
    };

    let Some(account) = account_update(&event) else {
        debug!("ignoring user event type {}", event.event_type);
        return;
    };

    for balance in &account.balances {
        if balance.asset == "USDT" {
            cache.set_wallet_balance(balance.wallet_balance.clone()).await;
        }
    }
    for position in &account.positions {
        if position.symbol == symbol {
            info!(
                "position update: amount={} entry_price={}",
                position.amount, position.entry_price
            );
            cache.set_position(symbol, position.amount.clone()).await;
            cache.set_entry_price(symbol, position.entry_price.clone()).await;
        }
    }
}

fn account_update(event: &UserDataEvent) -> Option<&crate::types::AccountPayload> {
    (event.event_type == "ACCOUNT_UPDATE").then_some(&event.account)
}

/// Returns true when shutdown fired during the wait.
async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(d) => false,
    }
}
