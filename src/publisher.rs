// src/publisher.rs
//! Top-N publisher: a dedicated sink task fed by a capacity-1 nudge
//! channel. The stream task never waits on the cache; if a nudge is
//! already pending, the eventual publish reads the newer book anyway.

use crate::cache::CacheWriter;
use crate::metrics::HealthMetrics;
use crate::orderbook::LocalBook;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub const TOP_N_DEPTH: usize = 20;

pub async fn run_top_n_publisher(
    book: Arc<LocalBook>,
    cache: CacheWriter,
    mut nudge_rx: mpsc::Receiver<()>,
    metrics: HealthMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            nudge = nudge_rx.recv() => {
                if nudge.is_none() {
                    return;
                }
                // A gap may have landed between the nudge and now.
                if !book.is_live() {
                    continue;
                }
                let slice = book.top_n(TOP_N_DEPTH);
                if cache.publish_top_n(&slice).await {
                    metrics.record_slice_published();
                } else {
                    metrics.record_cache_write_failure();
                }
            }
        }
    }
}
