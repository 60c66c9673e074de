// src/metrics.rs
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::info;

#[derive(Default, Clone)]
struct Counters {
    events_applied: u64,
    events_dropped: u64,
    gaps: u64,
    snapshots_installed: u64,
    slices_published: u64,
    cache_write_failures: u64,
    stream_reconnects: u64,
}

/// Process health counters, drained into one structured log line per
/// interval. Recording is a short lock on the hot path; the drain task
/// owns the cadence.
#[derive(Clone)]
pub struct HealthMetrics {
    inner: Arc<Mutex<Counters>>,
}

impl HealthMetrics {
    pub fn new() -> Self {
        HealthMetrics {
            inner: Arc::new(Mutex::new(Counters::default())),
        }
    }

    pub fn record_applied(&self) {
        self.inner.lock().events_applied += 1;
    }

    pub fn record_dropped(&self) {
        self.inner.lock().events_dropped += 1;
    }

    pub fn record_gap(&self) {
        self.inner.lock().gaps += 1;
    }

    pub fn record_snapshot_installed(&self) {
        self.inner.lock().snapshots_installed += 1;
    }

    pub fn record_slice_published(&self) {
        self.inner.lock().slices_published += 1;
    }

    pub fn record_cache_write_failure(&self) {
        self.inner.lock().cache_write_failures += 1;
    }

    pub fn record_stream_reconnect(&self) {
        self.inner.lock().stream_reconnects += 1;
    }

    fn snapshot_and_reset(&self) -> Counters {
        let mut s = self.inner.lock();
        let out = s.clone();
        *s = Counters::default();
        out
    }

    /// Background task: logs and zeroes the counters once per period.
    pub async fn run_health_log(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let c = self.snapshot_and_reset();
                    info!(
                        applied = c.events_applied,
                        dropped = c.events_dropped,
                        gaps = c.gaps,
                        snapshots = c.snapshots_installed,
                        published = c.slices_published,
                        cache_failures = c.cache_write_failures,
                        reconnects = c.stream_reconnects,
                        "gateway health"
                    );
                }
            }
        }
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}
