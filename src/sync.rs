// src/sync.rs
//! Snapshot/stream stitch lifecycle. The stream starts first and its
//! pre-snapshot frames fall on the floor; after a short delay the
//! coordinator installs a snapshot that lands inside live traffic, and the
//! next overlapping frame stitches. Every gap signal afterwards buys a
//! fresh snapshot, with jittered backoff between failed fetches.

use crate::metrics::HealthMetrics;
use crate::orderbook::LocalBook;
use crate::rest::fetch_depth_snapshot;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// How long to let the stream run before the first snapshot fetch.
    pub cold_start_delay: Duration,
    /// Depth levels requested from REST.
    pub snapshot_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            cold_start_delay: Duration::from_secs(2),
            snapshot_limit: 1000,
            backoff_base_ms: 250,
            backoff_cap_ms: 30_000,
        }
    }
}

pub async fn run_sync_coordinator(
    http: reqwest::Client,
    base_url: String,
    book: Arc<LocalBook>,
    mut resync_rx: mpsc::Receiver<()>,
    metrics: HealthMetrics,
    opts: SyncOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    if sleep_or_shutdown(opts.cold_start_delay, &mut shutdown).await {
        return;
    }
    if install_with_retry(&http, &base_url, &book, &metrics, &opts, &mut shutdown).await {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            signal = resync_rx.recv() => {
                if signal.is_none() {
                    // Stream side is gone; nothing left to coordinate.
                    return;
                }
                // Clear the latch so one gap buys exactly one fetch even if
                // the signal and the flag both fired.
                book.check_and_clear_resync();
                info!(symbol = %book.symbol(), "resync requested, refetching snapshot");
                if install_with_retry(&http, &base_url, &book, &metrics, &opts, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

/// Fetches and installs a snapshot, retrying with jittered exponential
/// backoff until it lands. Returns true when shutdown interrupted.
async fn install_with_retry(
    http: &reqwest::Client,
    base_url: &str,
    book: &LocalBook,
    metrics: &HealthMetrics,
    opts: &SyncOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return true;
        }
        match fetch_depth_snapshot(http, base_url, book.symbol(), opts.snapshot_limit).await {
            Ok(snapshot) => {
                book.install_snapshot(&snapshot);
                metrics.record_snapshot_installed();
                return false;
            }
            Err(e) => {
                let delay = backoff_ms_with_jitter(opts.backoff_base_ms, attempt, opts.backoff_cap_ms);
                warn!(
                    "snapshot fetch failed (attempt {}): {:?}; retrying in {}ms",
                    attempt + 1,
                    e,
                    delay
                );
                attempt = attempt.saturating_add(1);
                if sleep_or_shutdown(Duration::from_millis(delay), shutdown).await {
                    return true;
                }
            }
        }
    }
}

fn backoff_ms_with_jitter(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let mut rng = rand::thread_rng();
    let exp_pow = std::cmp::min(attempt, 63);
    let multiplier = 1u64.checked_shl(exp_pow).unwrap_or(u64::MAX);
    let mut exp = base_ms.saturating_mul(multiplier);
    if exp > cap_ms {
        exp = cap_ms;
    }
    rng.gen_range(0..=exp)
}

async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn backoff_stays_within_the_cap() {
        for attempt in 0..100 {
            let d = backoff_ms_with_jitter(250, attempt, 30_000);
            assert!(d <= 30_000);
        }
    }

    #[tokio::test]
    async fn retries_until_the_snapshot_lands() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/fapi/v1/depth");
                then.status(502).body("bad gateway");
            })
            .await;

        let book = Arc::new(LocalBook::new("BTCUSDT"));
        let metrics = HealthMetrics::new();
        let opts = SyncOptions {
            cold_start_delay: Duration::from_millis(1),
            snapshot_limit: 1000,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
        };
        let (_tx, mut shutdown) = {
            let (tx, rx) = tokio::sync::watch::channel(false);
            (tx, rx)
        };

        let http = reqwest::Client::new();
        let handle = {
            let book = book.clone();
            let base_url = server.base_url();
            let metrics = metrics.clone();
            let opts = opts.clone();
            tokio::spawn(async move {
                install_with_retry(&http, &base_url, &book, &metrics, &opts, &mut shutdown).await
            })
        };

        // Let a few failures happen, then swap in a good response.
        tokio::time::sleep(Duration::from_millis(30)).await;
        failing.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/fapi/v1/depth");
                then.status(200).body(
                    r#"{"lastUpdateId":500,"bids":[["50000","1"]],"asks":[["50001","1"]]}"#,
                );
            })
            .await;

        let interrupted = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("retry loop should finish")
            .unwrap();
        assert!(!interrupted);
        assert_eq!(book.last_update_id(), 500);
        assert!(!book.is_live());
    }
}
