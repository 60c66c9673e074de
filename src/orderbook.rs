// src/orderbook.rs
//! Local replica of one symbol's futures order book, fed by a REST
//! snapshot and stitched incremental depth events.
//!
//! Writers (`install_snapshot`, `apply_event`) take the write lock, readers
//! (`top_n`) the read lock, so slices are always a coherent pair of sides.
//! The resync request latch is an atomic so the coordinator can poll it
//! without touching the book.

use crate::types::{now_ms, DepthEvent, DepthSnapshot, PriceLevel, TopNSnapshot};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// What `apply_event` did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Frame merged into the book, `last_update_id` advanced.
    Applied,
    /// Frame ignored (pre-snapshot, stale, or malformed); book untouched.
    Dropped,
    /// Continuity broke. The book is offline until a fresh snapshot lands.
    GapRequestResync,
}

#[derive(Default)]
struct BookState {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: i64,
    is_ready: bool,
    is_synced: bool,
}

pub struct LocalBook {
    symbol: String,
    state: RwLock<BookState>,
    needs_resync: AtomicBool,
}

impl LocalBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: RwLock::new(BookState::default()),
            needs_resync: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Replaces both sides with the snapshot contents and rewinds the sync
    /// state: ready, not yet stitched.
    pub fn install_snapshot(&self, snapshot: &DepthSnapshot) {
        let mut st = self.state.write();
        st.bids = BTreeMap::new();
        st.asks = BTreeMap::new();
        merge_levels_lossy(&mut st.bids, &snapshot.bids);
        merge_levels_lossy(&mut st.asks, &snapshot.asks);
        st.last_update_id = snapshot.last_update_id;
        st.is_ready = true;
        st.is_synced = false;
        self.needs_resync.store(false, Ordering::Release);
        info!(
            symbol = %self.symbol,
            "snapshot installed: last_update_id={} bids={} asks={}",
            st.last_update_id,
            st.bids.len(),
            st.asks.len()
        );
    }

    /// Applies one incremental frame per the stitch protocol.
    ///
    /// Before the first stitch an overlapping frame joins the stream to the
    /// snapshot; a frame entirely ahead of the snapshot is force-stitched
    /// (cold start without a replay buffer). Once stitched, `pu` must equal
    /// the current `last_update_id` or the book goes offline and a resync
    /// is requested.
    pub fn apply_event(&self, event: &DepthEvent) -> ApplyOutcome {
        let mut st = self.state.write();

        if !st.is_ready {
            return ApplyOutcome::Dropped;
        }
        if event.final_update_id < st.last_update_id {
            return ApplyOutcome::Dropped;
        }

        // Parse before touching anything so a malformed frame cannot leave
        // a half-applied book or a half-flipped sync state behind.
        let parsed_bids = match parse_levels(&event.bids) {
            Some(v) => v,
            None => {
                warn!(symbol = %self.symbol, "dropping frame with non-numeric bid levels");
                return ApplyOutcome::Dropped;
            }
        };
        let parsed_asks = match parse_levels(&event.asks) {
            Some(v) => v,
            None => {
                warn!(symbol = %self.symbol, "dropping frame with non-numeric ask levels");
                return ApplyOutcome::Dropped;
            }
        };

        if !st.is_synced {
            if event.first_update_id <= st.last_update_id
                && st.last_update_id <= event.final_update_id
            {
                st.is_synced = true;
                info!(
                    symbol = %self.symbol,
                    "stream stitched onto snapshot at update id {}",
                    st.last_update_id
                );
            } else if event.first_update_id > st.last_update_id {
                // Snapshot predates everything still on the wire; jump the
                // book forward rather than deadlocking on a seam frame that
                // will never come.
                st.is_synced = true;
                warn!(
                    symbol = %self.symbol,
                    "force stitch across missing range: first_id={} snapshot_id={}",
                    event.first_update_id,
                    st.last_update_id
                );
            } else {
                return ApplyOutcome::Dropped;
            }
        } else if event.prev_final_update_id != st.last_update_id {
            st.is_ready = false;
            st.is_synced = false;
            self.needs_resync.store(true, Ordering::Release);
            warn!(
                symbol = %self.symbol,
                "update id gap: expected pu={} got pu={} (u={})",
                st.last_update_id,
                event.prev_final_update_id,
                event.final_update_id
            );
            return ApplyOutcome::GapRequestResync;
        }

        merge_levels(&mut st.bids, parsed_bids);
        merge_levels(&mut st.asks, parsed_asks);
        st.last_update_id = event.final_update_id;
        ApplyOutcome::Applied
    }

    /// Sorted, truncated view of both sides: best `n` bids descending,
    /// best `n` asks ascending. Safe to call while a writer is applying.
    pub fn top_n(&self, n: usize) -> TopNSnapshot {
        let st = self.state.read();
        TopNSnapshot {
            symbol: self.symbol.clone(),
            last_update_id: st.last_update_id,
            timestamp_ms: now_ms(),
            bids: st
                .bids
                .iter()
                .rev()
                .take(n)
                .map(|(p, q)| PriceLevel { price: *p, qty: *q })
                .collect(),
            asks: st
                .asks
                .iter()
                .take(n)
                .map(|(p, q)| PriceLevel { price: *p, qty: *q })
                .collect(),
        }
    }

    /// True between stitch and the next gap; the only window in which
    /// slices may be published.
    pub fn is_live(&self) -> bool {
        let st = self.state.read();
        st.is_ready && st.is_synced
    }

    pub fn last_update_id(&self) -> i64 {
        self.state.read().last_update_id
    }

    /// Reads and clears the resync request in one step, so one gap drives
    /// exactly one snapshot fetch.
    pub fn check_and_clear_resync(&self) -> bool {
        self.needs_resync.swap(false, Ordering::AcqRel)
    }
}

fn parse_levels(levels: &[[String; 2]]) -> Option<Vec<(Decimal, Decimal)>> {
    levels
        .iter()
        .map(|l| {
            let price = Decimal::from_str(&l[0]).ok()?;
            let qty = Decimal::from_str(&l[1]).ok()?;
            Some((price, qty))
        })
        .collect()
}

fn merge_levels(book: &mut BTreeMap<Decimal, Decimal>, updates: Vec<(Decimal, Decimal)>) {
    for (price, qty) in updates {
        if qty.is_zero() {
            book.remove(&price);
        } else {
            book.insert(price, qty);
        }
    }
}

/// Snapshot bodies come straight from REST; an unparsable level there is
/// skipped rather than failing the whole install.
fn merge_levels_lossy(book: &mut BTreeMap<Decimal, Decimal>, levels: &[[String; 2]]) {
    for l in levels {
        let (Ok(price), Ok(qty)) = (Decimal::from_str(&l[0]), Decimal::from_str(&l[1])) else {
            warn!("skipping non-numeric snapshot level {:?}", l);
            continue;
        };
        if !qty.is_zero() {
            book.insert(price, qty);
        }
    }
}
