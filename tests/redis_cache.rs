// tests/redis_cache.rs
//! Cache round trips against a local Redis. Skips (passes vacuously) when
//! no server answers on the default port, so CI without Redis stays green.

use depth_gateway::cache::CacheWriter;
use depth_gateway::orderbook::LocalBook;
use depth_gateway::types::{DepthEvent, DepthSnapshot, TopNSnapshot};
use redis::AsyncCommands;

const TEST_DB: i64 = 15;

async fn test_cache() -> Option<(CacheWriter, redis::aio::MultiplexedConnection)> {
    let cache = match CacheWriter::connect("127.0.0.1:6379", TEST_DB).await {
        Ok(c) => c,
        Err(_) => {
            eprintln!("redis not available, skipping integration test");
            return None;
        }
    };
    let client = redis::Client::open(format!("redis://127.0.0.1:6379/{}", TEST_DB)).ok()?;
    let conn = client.get_multiplexed_async_connection().await.ok()?;
    Some((cache, conn))
}

#[tokio::test]
async fn wallet_position_and_entry_round_trip() {
    let Some((cache, mut conn)) = test_cache().await else {
        return;
    };

    assert!(cache.set_wallet_balance("1234.56".to_string()).await);
    assert!(cache.set_position("BTCUSDT", "0.01".to_string()).await);
    assert!(cache.set_entry_price("BTCUSDT", "50000.0".to_string()).await);

    let balance: String = conn.get("Wallet:USDT").await.unwrap();
    let position: String = conn.get("Position:BTCUSDT").await.unwrap();
    let entry: String = conn.get("EntryPrice:BTCUSDT").await.unwrap();
    assert_eq!(balance, "1234.56");
    assert_eq!(position, "0.01");
    assert_eq!(entry, "50000.0");
}

#[tokio::test]
async fn published_slice_round_trips_through_the_cache() {
    let Some((cache, mut conn)) = test_cache().await else {
        return;
    };

    let book = LocalBook::new("BTCUSDT");
    book.install_snapshot(&DepthSnapshot {
        last_update_id: 100,
        bids: vec![
            ["50000".to_string(), "1.5".to_string()],
            ["49999".to_string(), "2.0".to_string()],
        ],
        asks: vec![
            ["50001".to_string(), "1.0".to_string()],
            ["50002".to_string(), "0.5".to_string()],
        ],
    });
    book.apply_event(&DepthEvent {
        first_update_id: 99,
        final_update_id: 101,
        prev_final_update_id: 98,
        ..DepthEvent::default()
    });

    assert!(cache.publish_top_n(&book.top_n(20)).await);

    let raw: String = conn.get("OrderBook:BTCUSDT").await.unwrap();
    let slice: TopNSnapshot = serde_json::from_str(&raw).unwrap();
    assert_eq!(slice.symbol, "BTCUSDT");
    assert_eq!(slice.last_update_id, 101);
    assert!(!slice.bids.is_empty() && !slice.asks.is_empty());
    assert!(slice.bids[0].price > slice.bids[1].price);
    assert!(slice.asks[0].price < slice.asks[1].price);
}
