//! Executor (SPEC_FULL.md §4.4): the module wiring plus the multi-scope
//! dispatch that sits above the single-scope pipeline.
//!
//! Grounded on `main.rs`'s `AppState`/background-task wiring for the
//! services-injection shape, generalized from one dry-run/live adapter pair
//! to the three portfolio scopes named in SPEC_FULL §3's data model
//! ("written once per group per scope").

pub mod activity;
pub mod executor;
pub mod guardrails;
pub mod portfolio;
pub mod simulate;
pub mod sizing;

pub use executor::{dry_run_group, execute_group, Services};

use crate::aggregate::buffer::BufferFlush;
use crate::error::PersistenceError;
use crate::model::{CopyAttempt, Decision, PortfolioScope, ReasonCode, SourceType, TradeEventGroup};
use tracing::{error, warn};

/// Runs one `TradeEventGroup` against every applicable portfolio scope.
///
/// `EXEC_GLOBAL` and `EXEC_USER` both run the real pipeline (pooled config
/// for the former, per-leader overrides for the latter); `SHADOW_USER`
/// always runs as a 1:1 raw mirror — it exists solely to track a leader's
/// own exposure (`E_L`) for budgeted-dynamic sizing, so it bypasses sizing,
/// budget enforcement, and guardrails entirely (see `execute_group`'s
/// `shadow_mirror` flag).
pub async fn dispatch_group(services: &Services, group: &TradeEventGroup) -> Vec<CopyAttempt> {
    let mut attempts = Vec::with_capacity(3);

    for (scope, shadow_mirror) in [
        (PortfolioScope::ExecGlobal, false),
        (PortfolioScope::ExecUser, false),
        (PortfolioScope::ShadowUser, true),
    ] {
        if scope != PortfolioScope::ExecGlobal && group.followed_user_id.is_none() {
            continue;
        }
        match execute_group(services, group, scope, shadow_mirror).await {
            Ok(attempt) => attempts.push(attempt),
            Err(e) => error!(error = %e, scope = %scope, group_key = %group.group_key, "execute_group failed"),
        }
    }

    attempts
}

/// Persists a buffer-level skip (`BELOW_MIN_EXEC_NOTIONAL`) that never made
/// it to a `TradeEventGroup`. Written for every scope the group would
/// otherwise have reached; the shadow mirror gets the same SKIP record
/// since the buffer discarded the net notional before a group could exist.
pub fn persist_buffer_skip(services: &Services, flush: BufferFlush) -> Result<Vec<CopyAttempt>, PersistenceError> {
    let BufferFlush::SkipBelowMinExec { followed_user_id, token_id: _, side: _, group_key } = flush else {
        warn!("persist_buffer_skip called with a BufferFlush::Group; ignoring");
        return Ok(Vec::new());
    };

    let mut attempts = Vec::with_capacity(2);
    for scope in [PortfolioScope::ExecGlobal, PortfolioScope::ExecUser] {
        let attempt = CopyAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: scope,
            followed_user_id: Some(followed_user_id.clone()),
            group_key: group_key.clone(),
            decision: Decision::Skip,
            reason_codes: vec![ReasonCode::BelowMinExecNotional],
            source_type: SourceType::Buffer,
            buffered_trade_count: 0,
            target_notional_micros: crate::model::Amount::zero(),
            filled_notional_micros: crate::model::Amount::zero(),
            filled_share_micros: crate::model::Amount::zero(),
            vwap_price_micros: 0,
            filled_ratio_bps: 0,
            their_reference_price_micros: 0,
            mid_price_micros_at_decision: 0,
            created_at: chrono::Utc::now(),
        };
        services.store.upsert_copy_attempt(&attempt)?;
        attempts.push(attempt);
    }
    Ok(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookService;
    use crate::config::ConfigStore;
    use crate::ledger::Store;
    use parking_lot::RwLock;
    use std::sync::Arc;

    async fn test_services() -> Services {
        let store = Store::open_in_memory().unwrap();
        let (service, _ws, _sweep) = BookService::new(
            "wss://example.invalid/ws".to_string(),
            "https://example.invalid".to_string(),
            store.clone(),
        );
        Services { book: Arc::new(service), store, config: Arc::new(RwLock::new(ConfigStore::default())) }
    }

    #[tokio::test]
    async fn dispatch_runs_global_and_user_and_shadow_for_a_leader_group() {
        let services = test_services().await;
        let group = TradeEventGroup {
            group_key: "leader-1:tok:BUY:2026-01-01T00:00:00Z".to_string(),
            followed_user_id: Some("leader-1".to_string()),
            token_id: "tok".to_string(),
            side: crate::model::Side::Buy,
            total_notional_micros: crate::model::Amount::from_i64(5_000_000),
            total_share_micros: crate::model::Amount::from_i64(10_000_000),
            vwap_price_micros: 500_000,
            source_type: SourceType::Immediate,
            buffered_trade_count: 1,
            window_start: chrono::Utc::now(),
            contributing_event_ids: vec!["e1".to_string()],
        };
        let attempts = dispatch_group(&services, &group).await;
        assert_eq!(attempts.len(), 3);
        let scopes: Vec<PortfolioScope> = attempts.iter().map(|a| a.portfolio_scope).collect();
        assert!(scopes.contains(&PortfolioScope::ExecGlobal));
        assert!(scopes.contains(&PortfolioScope::ExecUser));
        assert!(scopes.contains(&PortfolioScope::ShadowUser));
    }

    #[test]
    fn persist_buffer_skip_writes_global_and_user_only() {
        let services_rt = tokio::runtime::Runtime::new().unwrap();
        let services = services_rt.block_on(test_services());
        let flush = BufferFlush::SkipBelowMinExec {
            followed_user_id: "leader-1".to_string(),
            token_id: "tok".to_string(),
            side: crate::model::Side::Buy,
            group_key: "leader-1:tok:BUY:2026-01-01T00:00:00Z".to_string(),
        };
        let attempts = persist_buffer_skip(&services, flush).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.reason_codes == vec![ReasonCode::BelowMinExecNotional]));
    }
}
