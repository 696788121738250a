//! Small-trade buffer (SPEC_FULL.md §4.3): coalesces sub-threshold leader
//! trades per `(followedUserId, tokenId[, side])` until a flush rule fires.
//!
//! Grounded stylistically on the same per-key task-ownership idiom as
//! [`crate::aggregate::window`], with the flush-rule ordering taken
//! verbatim from the spec's §4.3 algorithm.

use crate::aggregate::window::group_key;
use crate::book::cache::now_ms;
use crate::config::NettingMode;
use crate::model::{micros, Amount, PendingTradeEvent, ReasonCode, Side, SourceType, TradeEventGroup};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferParams {
    pub flush_min_notional_micros: i64,
    pub min_exec_notional_micros: i64,
    pub max_buffer_ms: u64,
    pub quiet_flush_ms: u64,
    pub netting_mode: NettingMode,
}

pub enum BufferFlush {
    Group(TradeEventGroup),
    SkipBelowMinExec { followed_user_id: String, token_id: String, side: Side, group_key: String },
}

struct BufferState {
    /// Signed in `netBuySell` mode (positive = net buy); always non-negative
    /// in `sameSideOnly` mode since the key already pins the side.
    net_notional: Amount,
    net_share: Amount,
    earliest_detect_time_ms: i64,
    bucket_started_at_ms: i64,
    last_activity_ms: i64,
    contributing: Vec<String>,
}

pub struct SmallTradeBuffer {
    params: BufferParams,
    inner: Mutex<HashMap<String, BufferState>>,
    emit: mpsc::UnboundedSender<BufferFlush>,
}

impl SmallTradeBuffer {
    pub fn new(params: BufferParams, emit: mpsc::UnboundedSender<BufferFlush>) -> Arc<Self> {
        Arc::new(SmallTradeBuffer { params, inner: Mutex::new(HashMap::new()), emit })
    }

    fn key_for(&self, event: &PendingTradeEvent) -> String {
        match self.params.netting_mode {
            NettingMode::SameSideOnly => format!("{}:{}:{}", event.followed_user_id, event.token_id(), event.side.as_str()),
            NettingMode::NetBuySell => format!("{}:{}", event.followed_user_id, event.token_id()),
        }
    }

    /// Appends `event`, then checks the flush rules in spec order. Returns
    /// once the event is accounted for; flush (if any) happens inline.
    pub fn ingest(self: &Arc<Self>, event: PendingTradeEvent) {
        let now = now_ms();
        let key = self.key_for(&event);
        let sign = match (self.params.netting_mode, event.side) {
            (NettingMode::NetBuySell, Side::Sell) => -1,
            _ => 1,
        };
        let detect_time_ms = event.detect_time.timestamp_millis();

        let is_new = {
            let mut inner = self.inner.lock();
            let is_new = !inner.contains_key(&key);
            let entry = inner.entry(key.clone()).or_insert_with(|| BufferState {
                net_notional: Amount::zero(),
                net_share: Amount::zero(),
                earliest_detect_time_ms: detect_time_ms,
                bucket_started_at_ms: now,
                last_activity_ms: now,
                contributing: Vec::new(),
            });
            let signed_notional = if sign < 0 { -&event.notional_micros } else { event.notional_micros.clone() };
            let signed_share = if sign < 0 { -&event.share_micros } else { event.share_micros.clone() };
            entry.net_notional = &entry.net_notional + &signed_notional;
            entry.net_share = &entry.net_share + &signed_share;
            entry.earliest_detect_time_ms = entry.earliest_detect_time_ms.min(detect_time_ms);
            entry.last_activity_ms = now;
            entry.contributing.push(event.id.clone());
            is_new
        };

        if is_new {
            self.spawn_deadline_task(key.clone());
        }

        self.maybe_flush(&key);
    }

    fn spawn_deadline_task(self: &Arc<Self>, key: String) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let next_wake = {
                    let inner = this.inner.lock();
                    match inner.get(&key) {
                        None => return,
                        Some(state) => {
                            let max_deadline = state.bucket_started_at_ms + this.params.max_buffer_ms as i64;
                            let quiet_deadline = state.last_activity_ms + this.params.quiet_flush_ms as i64;
                            max_deadline.min(quiet_deadline)
                        }
                    }
                };
                let delay = (next_wake - now_ms()).max(0);
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                if this.maybe_flush(&key) {
                    return;
                }
            }
        });
    }

    /// Checks rules 1-3 and flushes if any holds. Returns whether a flush
    /// happened (so the deadline task knows to stop).
    fn maybe_flush(self: &Arc<Self>, key: &str) -> bool {
        let now = now_ms();
        let due = {
            let inner = self.inner.lock();
            match inner.get(key) {
                None => return true,
                Some(state) => {
                    let magnitude = state.net_notional.abs();
                    magnitude.to_i64_saturating() >= self.params.flush_min_notional_micros
                        || now - state.bucket_started_at_ms >= self.params.max_buffer_ms as i64
                        || now - state.last_activity_ms >= self.params.quiet_flush_ms as i64
                }
            }
        };
        if !due {
            return false;
        }
        self.flush_key(key);
        true
    }

    fn flush_key(&self, key: &str) {
        let state = self.inner.lock().remove(key);
        let Some(state) = state else { return };
        if state.contributing.is_empty() {
            return;
        }

        let side = if state.net_notional.is_negative() { Side::Sell } else { Side::Buy };
        let magnitude_notional = state.net_notional.abs();
        let magnitude_share = state.net_share.abs();

        let mut parts = key.splitn(3, ':');
        let followed_user_id = parts.next().unwrap_or_default().to_string();
        let token_id = parts.next().unwrap_or_default().to_string();

        if magnitude_notional.to_i64_saturating() < self.params.min_exec_notional_micros {
            let _ = self.emit.send(BufferFlush::SkipBelowMinExec {
                group_key: group_key(&followed_user_id, &token_id, side, state.bucket_started_at_ms),
                followed_user_id,
                token_id,
                side,
            });
            return;
        }

        let vwap = micros::vwap_price(&magnitude_notional, &magnitude_share);
        let group = TradeEventGroup {
            group_key: group_key(&followed_user_id, &token_id, side, state.bucket_started_at_ms),
            followed_user_id: Some(followed_user_id),
            token_id,
            side,
            total_notional_micros: magnitude_notional,
            total_share_micros: magnitude_share,
            vwap_price_micros: vwap,
            source_type: SourceType::Buffer,
            buffered_trade_count: state.contributing.len() as u32,
            window_start: Utc.timestamp_millis_opt(state.earliest_detect_time_ms).single().unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap()),
            contributing_event_ids: state.contributing,
        };
        let _ = self.emit.send(BufferFlush::Group(group));
    }

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

/// `BELOW_MIN_EXEC_NOTIONAL` is the only reason code the buffer can emit on
/// its own, bypassing the executor's guardrail pipeline entirely.
pub const BUFFER_SKIP_REASON: ReasonCode = ReasonCode::BelowMinExecNotional;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(id: &str, side: Side, notional: i64, shares: i64, detect_time_ms: i64) -> PendingTradeEvent {
        let dt = Utc.timestamp_millis_opt(detect_time_ms).single().unwrap();
        PendingTradeEvent {
            id: id.to_string(),
            followed_user_id: "leader-1".to_string(),
            asset_id: "asset-1".to_string(),
            raw_token_id: None,
            market_id: "market-1".to_string(),
            side,
            price_micros: 500_000,
            share_micros: Amount::from_i64(shares),
            notional_micros: Amount::from_i64(notional),
            detect_time: dt,
            event_time: dt,
        }
    }

    fn default_params() -> BufferParams {
        BufferParams {
            flush_min_notional_micros: 500_000,
            min_exec_notional_micros: 100_000,
            max_buffer_ms: 2_500,
            quiet_flush_ms: 600,
            netting_mode: NettingMode::SameSideOnly,
        }
    }

    #[tokio::test]
    async fn flushes_immediately_once_flush_min_reached() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = SmallTradeBuffer::new(default_params(), tx);
        let now = now_ms();
        buffer.ingest(event("e1", Side::Buy, 600_000, 1_200_000, now));
        let flush = rx.try_recv().expect("should flush synchronously past flushMinNotional");
        match flush {
            BufferFlush::Group(g) => {
                assert_eq!(g.source_type, SourceType::Buffer);
                assert_eq!(g.total_notional_micros, Amount::from_i64(600_000));
            }
            _ => panic!("expected a group flush"),
        }
    }

    #[tokio::test]
    async fn quiet_flush_after_scenario_s4() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = SmallTradeBuffer::new(default_params(), tx);
        let now = now_ms();
        buffer.ingest(event("e1", Side::Buy, 100_000, 200_000, now));
        buffer.ingest(event("e2", Side::Buy, 120_000, 240_000, now + 100));
        buffer.ingest(event("e3", Side::Buy, 150_000, 300_000, now + 200));
        assert_eq!(buffer.pending_key_count(), 1);

        let flush = tokio::time::timeout(Duration::from_millis(1_500), rx.recv())
            .await
            .expect("should quiet-flush within maxBufferMs margin")
            .expect("channel open");
        match flush {
            BufferFlush::Group(g) => {
                assert_eq!(g.buffered_trade_count, 3);
                assert_eq!(g.total_notional_micros, Amount::from_i64(370_000));
                assert_eq!(g.vwap_price_micros, 500_000);
            }
            _ => panic!("expected a group flush"),
        }
    }

    #[tokio::test]
    async fn below_min_exec_emits_skip() {
        let params = BufferParams { min_exec_notional_micros: 200_000, ..default_params() };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = SmallTradeBuffer::new(params, tx);
        let now = now_ms();
        buffer.ingest(event("e1", Side::Buy, 50_000, 100_000, now));

        let flush = tokio::time::timeout(Duration::from_millis(1_500), rx.recv())
            .await
            .expect("should quiet-flush")
            .expect("channel open");
        match flush {
            BufferFlush::SkipBelowMinExec { .. } => {}
            _ => panic!("expected a below-min-exec skip"),
        }
    }
}
