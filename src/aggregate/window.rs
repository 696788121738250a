//! Aggregator (SPEC_FULL.md §4.2): buckets `PendingTradeEvent`s sharing
//! `(followedUserId, tokenId, side)` into 2 s windows.
//!
//! No teacher file does window bucketing directly; this follows the
//! teacher's per-key single-timer idiom (one task owns a key's state from
//! creation to flush, mirroring how the deleted per-symbol session tasks
//! managed their own lifecycle) plus §9's "single scheduler" design note.

use crate::book::cache::now_ms;
use crate::model::{micros, Amount, PendingTradeEvent, SourceType, TradeEventGroup};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

pub const WINDOW_MS: i64 = 2_000;

struct PendingGroup {
    events: Vec<PendingTradeEvent>,
    window_start_ms: i64,
}

pub struct Aggregator {
    inner: Mutex<HashMap<String, PendingGroup>>,
    emit: mpsc::UnboundedSender<TradeEventGroup>,
}

impl Aggregator {
    pub fn new(emit: mpsc::UnboundedSender<TradeEventGroup>) -> Arc<Self> {
        Arc::new(Aggregator { inner: Mutex::new(HashMap::new()), emit })
    }

    /// Appends `event` to its window, starting a single flush timer the
    /// first time a key is seen. Later events for the same key never reset
    /// the timer.
    pub fn ingest(self: &Arc<Self>, event: PendingTradeEvent) {
        let window_start_ms = floor_window(event.detect_time.timestamp_millis(), WINDOW_MS);
        let key = aggregation_key(&event.followed_user_id, event.token_id(), event.side);

        let is_new = {
            let mut inner = self.inner.lock();
            let is_new = !inner.contains_key(&key);
            let entry = inner
                .entry(key.clone())
                .or_insert_with(|| PendingGroup { events: Vec::new(), window_start_ms });
            entry.events.push(event);
            is_new
        };

        if is_new {
            let this = self.clone();
            let key_for_task = key.clone();
            tokio::spawn(async move {
                let delay_ms = (window_start_ms + WINDOW_MS - now_ms()).max(0);
                tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                this.flush_key(&key_for_task);
            });
        }
    }

    fn flush_key(&self, key: &str) {
        let pending = self.inner.lock().remove(key);
        let Some(pending) = pending else { return };
        if pending.events.is_empty() {
            return;
        }
        let group = build_group(pending, SourceType::Aggregator);
        let _ = self.emit.send(group);
    }

    /// Forces every pending key to flush immediately; used on shutdown.
    pub fn force_flush_all(&self) {
        let keys: Vec<String> = self.inner.lock().keys().cloned().collect();
        for key in keys {
            self.flush_key(&key);
        }
    }

    pub fn pending_key_count(&self) -> usize {
        self.inner.lock().len()
    }
}

fn floor_window(time_ms: i64, window_ms: i64) -> i64 {
    time_ms.div_euclid(window_ms) * window_ms
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

pub fn aggregation_key(followed_user_id: &str, token_id: &str, side: crate::model::Side) -> String {
    format!("{}:{}:{}", followed_user_id, token_id, side.as_str())
}

pub fn group_key(followed_user_id: &str, token_id: &str, side: crate::model::Side, window_start_ms: i64) -> String {
    format!("{}:{}:{}:{}", followed_user_id, token_id, side.as_str(), millis_to_datetime(window_start_ms).to_rfc3339())
}

fn build_group(pending: PendingGroup, source_type: SourceType) -> TradeEventGroup {
    let first = &pending.events[0];
    let followed_user_id = first.followed_user_id.clone();
    let token_id = first.token_id().to_string();
    let side = first.side;

    let mut total_notional = Amount::zero();
    let mut total_share = Amount::zero();
    let mut earliest_detect_time = first.detect_time;
    let mut contributing_event_ids = Vec::with_capacity(pending.events.len());

    for event in &pending.events {
        total_notional = &total_notional + &event.notional_micros;
        total_share = &total_share + &event.share_micros;
        earliest_detect_time = earliest_detect_time.min(event.detect_time);
        contributing_event_ids.push(event.id.clone());
    }

    let vwap = micros::vwap_price(&total_notional, &total_share);

    TradeEventGroup {
        group_key: group_key(&followed_user_id, &token_id, side, pending.window_start_ms),
        followed_user_id: Some(followed_user_id),
        token_id,
        side,
        total_notional_micros: total_notional,
        total_share_micros: total_share,
        vwap_price_micros: vwap,
        source_type,
        buffered_trade_count: pending.events.len() as u32,
        window_start: earliest_detect_time,
        contributing_event_ids,
    }
}
