// src/ingest/depth_stream.rs
//! Depth websocket reader. The transport layer owns connect/reconnect and
//! frame decoding only; every decoded event goes to a caller-supplied
//! handler, so the network loop never knows what a book is. Any transport
//! or close error tears the connection down and reconnects after a fixed
//! delay.

use crate::metrics::HealthMetrics;
use crate::orderbook::{ApplyOutcome, LocalBook};
use crate::types::DepthEvent;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Runs until the shutdown signal flips, feeding decoded frames to
/// `on_event`. A frame that fails to decode is logged and skipped without
/// dropping the connection.
pub async fn run_depth_stream<F>(
    url: String,
    mut on_event: F,
    metrics: HealthMetrics,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut(DepthEvent) + Send,
{
    loop {
        if *shutdown.borrow() {
            return;
        }

        info!("connecting depth stream: {}", url);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _resp)) => {
                info!("depth stream connected");
                let (mut write, mut read) = ws_stream.split();

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            info!("depth stream closed for shutdown");
                            return;
                        }
                        msg_opt = read.next() => {
                            let Some(msg) = msg_opt else {
                                warn!("depth stream ended, reconnecting");
                                break;
                            };
                            match msg {
                                Ok(Message::Text(txt)) => {
                                    match serde_json::from_str::<DepthEvent>(&txt) {
                                        Ok(event) => on_event(event),
                                        Err(e) => {
                                            warn!("depth frame decode error: {} payload={}", e, txt);
                                        }
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    if let Err(e) = write.send(Message::Pong(payload)).await {
                                        warn!("depth pong failed: {:?}", e);
                                        break;
                                    }
                                }
                                Ok(Message::Close(frame)) => {
                                    warn!("depth close received: {:?}", frame);
                                    break;
                                }
                                Err(e) => {
                                    warn!("depth recv error: {:?}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("failed to connect depth stream: {:?}", e);
            }
        }

        metrics.record_stream_reconnect();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// The standard handler: apply each frame to the book, nudge the publisher
/// on an applied delta, signal the coordinator on a gap. `try_send` on
/// both channels keeps the stream task from ever blocking on its
/// consumers; a pending nudge already covers the newer state.
pub fn apply_to_book(
    book: Arc<LocalBook>,
    publish_tx: mpsc::Sender<()>,
    resync_tx: mpsc::Sender<()>,
    metrics: HealthMetrics,
) -> impl FnMut(DepthEvent) + Send {
    move |event: DepthEvent| match book.apply_event(&event) {
        ApplyOutcome::Applied => {
            metrics.record_applied();
            let _ = publish_tx.try_send(());
        }
        ApplyOutcome::Dropped => {
            metrics.record_dropped();
            debug!(
                "dropped depth frame U={} u={}",
                event.first_update_id, event.final_update_id
            );
        }
        ApplyOutcome::GapRequestResync => {
            metrics.record_gap();
            let _ = resync_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DepthSnapshot;

    fn live_book() -> Arc<LocalBook> {
        let book = Arc::new(LocalBook::new("BTCUSDT"));
        book.install_snapshot(&DepthSnapshot {
            last_update_id: 100,
            bids: vec![],
            asks: vec![],
        });
        book
    }

    fn frame(txt: &str) -> DepthEvent {
        serde_json::from_str(txt).unwrap()
    }

    #[test]
    fn applied_frame_nudges_publisher() {
        let book = live_book();
        let (publish_tx, mut publish_rx) = mpsc::channel(1);
        let (resync_tx, _resync_rx) = mpsc::channel(1);
        let mut handler =
            apply_to_book(book.clone(), publish_tx, resync_tx, HealthMetrics::new());

        handler(frame(
            r#"{"e":"depthUpdate","E":1,"T":1,"s":"BTCUSDT",
                "U":99,"u":101,"pu":98,"b":[["50000","1.0"]],"a":[]}"#,
        ));

        assert!(publish_rx.try_recv().is_ok());
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn gap_frame_signals_resync_not_publish() {
        let book = live_book();
        let (publish_tx, mut publish_rx) = mpsc::channel(1);
        let (resync_tx, mut resync_rx) = mpsc::channel(1);
        let mut handler =
            apply_to_book(book.clone(), publish_tx, resync_tx, HealthMetrics::new());

        handler(frame(r#"{"U":99,"u":101,"pu":98,"b":[],"a":[]}"#));
        let _ = publish_rx.try_recv();

        handler(frame(r#"{"U":1000,"u":1001,"pu":999,"b":[],"a":[]}"#));

        assert!(resync_rx.try_recv().is_ok());
        assert!(publish_rx.try_recv().is_err());
        assert!(book.check_and_clear_resync());
    }

    #[test]
    fn pre_snapshot_frames_fall_through() {
        let book = Arc::new(LocalBook::new("BTCUSDT"));
        let (publish_tx, mut publish_rx) = mpsc::channel(1);
        let (resync_tx, _resync_rx) = mpsc::channel(1);
        let mut handler =
            apply_to_book(book.clone(), publish_tx, resync_tx, HealthMetrics::new());

        handler(frame(r#"{"U":1,"u":2,"pu":0,"b":[["50000","1"]],"a":[]}"#));
        assert!(publish_rx.try_recv().is_err());
        assert!(!book.is_live());
    }
}
