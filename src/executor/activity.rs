//! Merge/split/redeem handling (SPEC_FULL.md §4.5): these activity events
//! share trade events' 2 s aggregation window but never produce a fill —
//! each aggregated group is persisted directly as a SKIP.
//!
//! Grounded on [`crate::aggregate::window::Aggregator`]'s per-key
//! single-timer idiom, generalized from `(leader, token, side)` to
//! `(leader, activityType, sortedAssetIds)`.

use crate::book::cache::now_ms;
use crate::error::PersistenceError;
use crate::ledger::Store;
use crate::model::{CopyAttempt, Decision, PendingActivityEvent, PortfolioScope, ReasonCode, SourceType};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

pub const WINDOW_MS: i64 = 2_000;

#[derive(Debug, Clone)]
pub struct ActivityGroup {
    pub group_key: String,
    pub followed_user_id: String,
    pub activity_type: String,
    pub asset_ids: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub contributing_event_ids: Vec<String>,
}

struct PendingActivityGroup {
    events: Vec<PendingActivityEvent>,
    window_start_ms: i64,
}

pub struct ActivityAggregator {
    inner: Mutex<HashMap<String, PendingActivityGroup>>,
    emit: mpsc::UnboundedSender<ActivityGroup>,
}

impl ActivityAggregator {
    pub fn new(emit: mpsc::UnboundedSender<ActivityGroup>) -> Arc<Self> {
        Arc::new(ActivityAggregator { inner: Mutex::new(HashMap::new()), emit })
    }

    pub fn ingest(self: &Arc<Self>, event: PendingActivityEvent) {
        let window_start_ms = floor_window(event.detect_time.timestamp_millis(), WINDOW_MS);
        let key = activity_key(&event.followed_user_id, &event.activity_type, &event.asset_ids);

        let is_new = {
            let mut inner = self.inner.lock();
            let is_new = !inner.contains_key(&key);
            let entry = inner
                .entry(key.clone())
                .or_insert_with(|| PendingActivityGroup { events: Vec::new(), window_start_ms });
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
        let group = build_group(pending);
        let _ = self.emit.send(group);
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

fn floor_window(time_ms: i64, window_ms: i64) -> i64 {
    time_ms.div_euclid(window_ms) * window_ms
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

fn sorted_asset_ids(asset_ids: &[String]) -> Vec<String> {
    let mut sorted = asset_ids.to_vec();
    sorted.sort();
    sorted
}

pub fn activity_key(followed_user_id: &str, activity_type: &str, asset_ids: &[String]) -> String {
    format!("{}:{}:{}", followed_user_id, activity_type, sorted_asset_ids(asset_ids).join(","))
}

fn build_group(pending: PendingActivityGroup) -> ActivityGroup {
    let first = &pending.events[0];
    let followed_user_id = first.followed_user_id.clone();
    let activity_type = first.activity_type.clone();
    let mut asset_ids: Vec<String> = Vec::new();
    let mut earliest_detect_time = first.detect_time;
    let mut contributing_event_ids = Vec::with_capacity(pending.events.len());
    for event in &pending.events {
        for id in &event.asset_ids {
            if !asset_ids.contains(id) {
                asset_ids.push(id.clone());
            }
        }
        earliest_detect_time = earliest_detect_time.min(event.detect_time);
        contributing_event_ids.push(event.id.clone());
    }
    asset_ids.sort();

    ActivityGroup {
        group_key: format!(
            "{}:{}:{}:{}",
            followed_user_id,
            activity_type,
            asset_ids.join(","),
            millis_to_datetime(pending.window_start_ms).to_rfc3339()
        ),
        followed_user_id,
        activity_type,
        asset_ids,
        window_start: earliest_detect_time,
        contributing_event_ids,
    }
}

/// Persists an `ActivityGroup` as a SKIP for `EXEC_GLOBAL` and `EXEC_USER`.
/// No `SHADOW_USER` record: there is no notional to mirror and no leader
/// exposure to track here.
pub fn persist_activity_group(store: &Store, group: &ActivityGroup) -> Result<Vec<CopyAttempt>, PersistenceError> {
    let mut attempts = Vec::with_capacity(2);
    for scope in [PortfolioScope::ExecGlobal, PortfolioScope::ExecUser] {
        let attempt = CopyAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: scope,
            followed_user_id: Some(group.followed_user_id.clone()),
            group_key: group.group_key.clone(),
            decision: Decision::Skip,
            reason_codes: vec![ReasonCode::MergeSplitNotApplicable],
            source_type: SourceType::Aggregator,
            buffered_trade_count: group.contributing_event_ids.len() as u32,
            target_notional_micros: crate::model::Amount::zero(),
            filled_notional_micros: crate::model::Amount::zero(),
            filled_share_micros: crate::model::Amount::zero(),
            vwap_price_micros: 0,
            filled_ratio_bps: 0,
            their_reference_price_micros: 0,
            mid_price_micros_at_decision: 0,
            created_at: chrono::Utc::now(),
        };
        store.upsert_copy_attempt(&attempt)?;
        attempts.push(attempt);
    }
    Ok(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, leader: &str, activity_type: &str, asset_ids: &[&str], detect_time_ms: i64) -> PendingActivityEvent {
        PendingActivityEvent {
            id: id.to_string(),
            followed_user_id: leader.to_string(),
            activity_type: activity_type.to_string(),
            asset_ids: asset_ids.iter().map(|s| s.to_string()).collect(),
            detect_time: millis_to_datetime(detect_time_ms),
        }
    }

    #[test]
    fn activity_key_ignores_asset_id_order() {
        let a = activity_key("leader-1", "MERGE", &["b".to_string(), "a".to_string()]);
        let b = activity_key("leader-1", "MERGE", &["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn build_group_dedupes_asset_ids_and_sorts() {
        let pending = PendingActivityGroup {
            events: vec![
                event("e1", "leader-1", "SPLIT", &["tok-b"], 1_000),
                event("e2", "leader-1", "SPLIT", &["tok-a", "tok-b"], 1_200),
            ],
            window_start_ms: 0,
        };
        let group = build_group(pending);
        assert_eq!(group.asset_ids, vec!["tok-a".to_string(), "tok-b".to_string()]);
        assert_eq!(group.contributing_event_ids.len(), 2);
    }

    #[tokio::test]
    async fn ingest_flushes_after_window_elapses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = ActivityAggregator::new(tx);
        let now = now_ms();
        aggregator.ingest(event("e1", "leader-1", "REDEEM", &["tok-a"], now));
        assert_eq!(aggregator.pending_key_count(), 1);

        let group = tokio::time::timeout(Duration::from_millis(WINDOW_MS as u64 + 500), rx.recv())
            .await
            .expect("group should flush within window + margin")
            .expect("channel open");
        assert_eq!(group.activity_type, "REDEEM");
        assert_eq!(aggregator.pending_key_count(), 0);
    }

    #[test]
    fn persist_activity_group_writes_global_and_user_skip() {
        let store = Store::open_in_memory().unwrap();
        let group = ActivityGroup {
            group_key: "leader-1:MERGE:tok-a:2026-01-01T00:00:00Z".to_string(),
            followed_user_id: "leader-1".to_string(),
            activity_type: "MERGE".to_string(),
            asset_ids: vec!["tok-a".to_string()],
            window_start: Utc::now(),
            contributing_event_ids: vec!["e1".to_string()],
        };
        let attempts = persist_activity_group(&store, &group).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.decision == Decision::Skip));
        assert!(attempts.iter().all(|a| a.reason_codes == vec![ReasonCode::MergeSplitNotApplicable]));
    }
}
