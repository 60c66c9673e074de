// tests/gateway_flow.rs
//! End-to-end exercises of the stitch lifecycle with a mocked venue:
//! cold start, gap-driven resync, and the published slice shape.

use depth_gateway::metrics::HealthMetrics;
use depth_gateway::orderbook::{ApplyOutcome, LocalBook};
use depth_gateway::publisher::TOP_N_DEPTH;
use depth_gateway::sync::{run_sync_coordinator, SyncOptions};
use depth_gateway::types::{DepthEvent, DepthSnapshot};
use httpmock::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn event(first: i64, fin: i64, prev: i64, bids: &[[&str; 2]], asks: &[[&str; 2]]) -> DepthEvent {
    DepthEvent {
        first_update_id: first,
        final_update_id: fin,
        prev_final_update_id: prev,
        bids: bids.iter().map(|[p, q]| [p.to_string(), q.to_string()]).collect(),
        asks: asks.iter().map(|[p, q]| [p.to_string(), q.to_string()]).collect(),
        ..DepthEvent::default()
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn cold_start_then_gap_drives_a_full_resync() {
    let server = MockServer::start_async().await;
    let first_snapshot = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/fapi/v1/depth")
                .query_param("symbol", "BTCUSDT")
                .query_param("limit", "1000");
            then.status(200).body(
                r#"{"lastUpdateId":100,"bids":[["50000","1.5"]],"asks":[["50001","1.0"]]}"#,
            );
        })
        .await;

    let book = Arc::new(LocalBook::new("BTCUSDT"));
    let metrics = HealthMetrics::new();
    let (resync_tx, resync_rx) = mpsc::channel::<()>(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let opts = SyncOptions {
        cold_start_delay: Duration::from_millis(10),
        snapshot_limit: 1000,
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
    };
    let coordinator = tokio::spawn(run_sync_coordinator(
        reqwest::Client::new(),
        server.base_url(),
        book.clone(),
        resync_rx,
        metrics.clone(),
        opts,
        shutdown_rx,
    ));

    // Cold start: the snapshot lands and the stream stitches onto it.
    wait_for(|| book.last_update_id() == 100, "initial snapshot").await;
    assert!(!book.is_live());
    assert_eq!(
        book.apply_event(&event(99, 101, 98, &[["50000", "2.0"]], &[])),
        ApplyOutcome::Applied
    );
    assert!(book.is_live());

    // Continuity breaks; the book goes offline and requests a resync.
    assert_eq!(
        book.apply_event(&event(1000, 1001, 999, &[], &[])),
        ApplyOutcome::GapRequestResync
    );
    assert!(!book.is_live());

    first_snapshot.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/fapi/v1/depth");
            then.status(200).body(
                r#"{"lastUpdateId":2000,"bids":[["50010","1.0"]],"asks":[["50011","1.0"]]}"#,
            );
        })
        .await;

    resync_tx.send(()).await.unwrap();
    wait_for(|| book.last_update_id() == 2000, "resync snapshot").await;
    assert!(!book.is_live());

    // And the stream stitches again on the fresh base.
    assert_eq!(
        book.apply_event(&event(1999, 2001, 1998, &[], &[])),
        ApplyOutcome::Applied
    );
    assert!(book.is_live());

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), coordinator).await;
}

#[test]
fn published_slice_has_the_wire_shape() {
    let book = LocalBook::new("BTCUSDT");
    book.install_snapshot(&DepthSnapshot {
        last_update_id: 100,
        bids: vec![
            ["50000".to_string(), "1.5".to_string()],
            ["49999".to_string(), "2.0".to_string()],
        ],
        asks: vec![["50001".to_string(), "1.0".to_string()]],
    });
    book.apply_event(&event(99, 101, 98, &[], &[]));

    let slice = book.top_n(TOP_N_DEPTH);
    let json = serde_json::to_value(&slice).unwrap();

    assert_eq!(json["s"], "BTCUSDT");
    assert_eq!(json["u"], 101);
    assert!(json["t"].as_i64().unwrap() > 0);
    assert_eq!(json["b"][0]["p"], "50000");
    assert_eq!(json["b"][0]["q"], "1.5");
    assert_eq!(json["b"][1]["p"], "49999");
    assert_eq!(json["a"][0]["p"], "50001");
}

#[test]
fn slice_is_capped_at_the_published_depth() {
    let book = LocalBook::new("BTCUSDT");
    let bids: Vec<[String; 2]> = (0..50)
        .map(|i| [(40_000 + i).to_string(), "1".to_string()])
        .collect();
    book.install_snapshot(&DepthSnapshot {
        last_update_id: 100,
        bids,
        asks: vec![],
    });
    book.apply_event(&event(99, 101, 98, &[], &[]));

    let slice = book.top_n(TOP_N_DEPTH);
    assert_eq!(slice.bids.len(), TOP_N_DEPTH);
    assert_eq!(slice.bids[0].price.to_string(), "40049");
}
