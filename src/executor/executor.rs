//! Orchestration (SPEC_FULL.md §4.4): runs §4.4.1-4.4.8 in fixed order for
//! one `(TradeEventGroup, PortfolioScope)` pair and persists the decision.
//!
//! Grounded on `vault/trade_executor.rs::TradeExecutor::execute_for_user`'s
//! per-leader loop shape and dry-run/live branch, and `main.rs`'s `AppState`
//! for the services-injection pattern called out in SPEC_FULL §9
//! ("Singleton services").

use crate::book::BookService;
use crate::config::ConfigStore;
use crate::error::PersistenceError;
use crate::executor::guardrails::{self, GuardrailInput};
use crate::executor::portfolio::PortfolioReader;
use crate::executor::sizing::{self, BudgetEnforcementInput, BudgetOutcome, SizingInput};
use crate::executor::simulate;
use crate::ledger::Store;
use crate::model::{
    micros, Amount, CopyAttempt, Decision, EntryType, LedgerEntry, PortfolioScope, ReasonCode, SourceType, TradeEventGroup,
};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;

/// Process-wide collaborators the executor reads from, injected once at
/// startup rather than reached for through globals.
pub struct Services {
    pub book: Arc<BookService>,
    pub store: Store,
    pub config: Arc<RwLock<ConfigStore>>,
}

/// Runs the full pipeline for one scope. `shadow_mirror` selects the
/// `SHADOW_USER` behavior: sizing is a raw 1:1 mirror of the leader's trade
/// and neither budget enforcement nor guardrails/circuit-breakers apply —
/// it exists purely to track `E_L` for budgeted-dynamic sizing elsewhere.
pub async fn execute_group(
    services: &Services,
    group: &TradeEventGroup,
    scope: PortfolioScope,
    shadow_mirror: bool,
) -> Result<CopyAttempt, PersistenceError> {
    // §8 "Idempotence": a re-run of the same (scope, groupKey) — e.g. an
    // ingest retry or a duplicate webhook delivery — must not write a second
    // CopyAttempt, fill set, or ledger entry. Returning the prior decision
    // verbatim is simpler and cheaper than re-deriving a stable id for all
    // three downstream writes.
    if let Some(existing) =
        services.store.copy_attempt_full_by_scope_and_group(scope, group.followed_user_id.as_deref(), &group.group_key)?
    {
        return Ok(existing);
    }

    let effective = {
        let config = services.config.read();
        let leader_for_config = if scope == PortfolioScope::ExecGlobal { None } else { group.followed_user_id.as_deref() };
        config
            .effective_for(leader_for_config)
            .map_err(|e| PersistenceError::NotFound(format!("config resolution failed: {e}")))?
    };
    let system = { services.config.read().system.clone() };

    // EXEC_GLOBAL is one pooled book shared by every leader: portfolio
    // reads aggregate the whole scope rather than one leader's slice of it.
    // The ledger entry written below still carries the *actual* leader id
    // for attribution regardless of this.
    let portfolio_leader_key = if scope == PortfolioScope::ExecGlobal { None } else { group.followed_user_id.as_deref() };

    // 4.4.1 Timing realism.
    let latency_ms = effective.guardrails.decision_latency_ms;
    let jitter_ms = if effective.guardrails.jitter_ms_max > 0 {
        rand::thread_rng().gen_range(0..=effective.guardrails.jitter_ms_max)
    } else {
        0
    };
    if latency_ms + jitter_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms + jitter_ms)).await;
    }

    // 4.4.2 Read portfolio state.
    let reader = PortfolioReader::new(&services.store);
    let portfolio = reader.read(scope, portfolio_leader_key, system.initial_bankroll_micros)?;

    // 4.4.3 Min-leader-notional filter.
    if group.source_type != SourceType::Buffer
        && effective.sizing.min_leader_trade_notional_micros > 0
        && group.total_notional_micros < Amount::from_i64(effective.sizing.min_leader_trade_notional_micros)
    {
        return persist_skip(services, group, scope, vec![ReasonCode::LeaderTradeBelowMinNotional], Amount::zero());
    }

    // 4.4.4 Sizing.
    let target_notional_micros = if shadow_mirror {
        group.total_notional_micros.clone()
    } else {
        let shadow_exposure = match group.followed_user_id.as_deref() {
            Some(leader) => reader.shadow_leader_exposure(leader)?,
            None => 0,
        };
        let sizing_input = SizingInput {
            group,
            sizing: &effective.sizing,
            equity_micros: portfolio.equity_micros,
            shadow_leader_exposure_micros: shadow_exposure,
        };
        let result = sizing::size_trade(&sizing_input);
        if let Some(reason) = result.skip {
            return persist_skip(services, group, scope, vec![reason], result.target_notional_micros);
        }
        result.target_notional_micros
    };

    // 4.4.5 Budget enforcement (HARD mode only, skipped for the shadow mirror).
    let target_notional_micros = if shadow_mirror {
        target_notional_micros
    } else {
        let is_reducing = reader.is_reducing_exposure(scope, portfolio_leader_key, &group.token_id, group.side)?;
        let current_exposure_for_leader = group
            .followed_user_id
            .as_deref()
            .and_then(|id| portfolio.exposure_by_leader.get(id))
            .copied()
            .unwrap_or(0);
        let outcome = sizing::enforce_budget(
            &effective.sizing,
            target_notional_micros,
            is_reducing,
            &BudgetEnforcementInput {
                budget_usdc_micros: effective.sizing.budget_usdc_micros,
                current_exposure_for_leader_micros: current_exposure_for_leader,
                min_trade_notional_micros: effective.sizing.min_trade_notional_micros,
            },
        );
        match outcome {
            BudgetOutcome::Skip(reason) => {
                return persist_skip(services, group, scope, vec![reason], Amount::zero());
            }
            BudgetOutcome::Capped(t) | BudgetOutcome::Unchanged(t) => t,
        }
    };

    // 4.4.6 Book simulation.
    let lookup = services.book.get_book(&group.token_id, 2_000, 500).await;
    let Some(book) = lookup.book else {
        return persist_skip(services, group, scope, vec![ReasonCode::NoLiquidityWithinBounds], target_notional_micros);
    };

    let their_reference_price_micros = group.vwap_price_micros;
    let best_price_micros = match group.side {
        crate::model::Side::Buy => book.best_ask_micros,
        crate::model::Side::Sell => book.best_bid_micros,
    };
    let bounds = simulate::price_bounds(
        group.side,
        their_reference_price_micros,
        book.mid_price_micros,
        effective.guardrails.max_worsening_vs_their_fill_micros,
        effective.guardrails.max_over_mid_micros,
    );
    let target_shares = simulate::target_share_micros(&target_notional_micros, best_price_micros);
    let sim = simulate::simulate_fill_for_target_shares(group.side, &book, &bounds, &target_shares);

    // 4.4.7 Guardrails.
    let reasons = if shadow_mirror {
        if sim.filled_share_micros.is_zero() {
            vec![ReasonCode::NoLiquidityWithinBounds]
        } else {
            Vec::new()
        }
    } else {
        let is_reducing = reader.is_reducing_exposure(scope, portfolio_leader_key, &group.token_id, group.side)?;
        guardrails::evaluate(&GuardrailInput {
            side: group.side,
            asset_id: &group.token_id,
            followed_user_id: group.followed_user_id.as_deref(),
            sim: &sim,
            target_notional_micros: &target_notional_micros,
            their_reference_price_micros,
            guardrails: &effective.guardrails,
            portfolio: &portfolio,
            scope,
            is_reducing_exposure: is_reducing,
        })
    };

    let decision = if reasons.is_empty() { Decision::Execute } else { Decision::Skip };

    let attempt_id = uuid::Uuid::new_v4().to_string();
    let attempt = CopyAttempt {
        id: attempt_id.clone(),
        portfolio_scope: scope,
        followed_user_id: group.followed_user_id.clone(),
        group_key: group.group_key.clone(),
        decision,
        reason_codes: reasons,
        source_type: group.source_type,
        buffered_trade_count: group.buffered_trade_count,
        target_notional_micros: target_notional_micros.clone(),
        filled_notional_micros: if decision == Decision::Execute { sim.filled_notional_micros.clone() } else { Amount::zero() },
        filled_share_micros: if decision == Decision::Execute { sim.filled_share_micros.clone() } else { Amount::zero() },
        vwap_price_micros: if decision == Decision::Execute { sim.vwap_filled_micros } else { 0 },
        filled_ratio_bps: if decision == Decision::Execute { sim.filled_ratio_bps } else { 0 },
        their_reference_price_micros,
        mid_price_micros_at_decision: book.mid_price_micros,
        created_at: chrono::Utc::now(),
    };
    services.store.upsert_copy_attempt(&attempt)?;

    if decision == Decision::Execute {
        for fill in &sim.fills {
            let mut fill = fill.clone();
            fill.copy_attempt_id = attempt_id.clone();
            services.store.insert_fill(&fill)?;
        }

        let share_delta = match group.side {
            crate::model::Side::Buy => sim.filled_share_micros.clone(),
            crate::model::Side::Sell => &Amount::zero() - &sim.filled_share_micros,
        };
        // cashDeltaMicros = -shareDeltaMicros * priceMicros / 10^6 (entities.rs's LedgerEntry doc).
        let cash_delta = -&micros::notional_from_shares(&share_delta, sim.vwap_filled_micros);

        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: scope,
            followed_user_id: group.followed_user_id.clone(),
            market_id: group.token_id.clone(),
            asset_id: group.token_id.clone(),
            entry_type: EntryType::TradeFill,
            share_delta_micros: share_delta,
            cash_delta_micros: cash_delta,
            price_micros: sim.vwap_filled_micros,
            ref_id: format!("copy:{attempt_id}"),
            created_at: chrono::Utc::now(),
        };
        services.store.insert_ledger_entry_idempotent(&entry)?;
    }

    Ok(attempt)
}

/// Non-persisting replay of §4.4.2-4.4.7 for one group under the given
/// scope, used by `POST /api/config/test` (SPEC_FULL §6.5) to report what
/// the *current* config would have done to recent groups without writing
/// fills, ledger entries, or copy attempts. Skips the §4.4.1 latency sleep —
/// a replay isn't standing in for real order timing.
pub async fn dry_run_group(services: &Services, group: &TradeEventGroup, scope: PortfolioScope) -> Result<Decision, PersistenceError> {
    let effective = {
        let config = services.config.read();
        let leader_for_config = if scope == PortfolioScope::ExecGlobal { None } else { group.followed_user_id.as_deref() };
        config
            .effective_for(leader_for_config)
            .map_err(|e| PersistenceError::NotFound(format!("config resolution failed: {e}")))?
    };

    let portfolio_leader_key = if scope == PortfolioScope::ExecGlobal { None } else { group.followed_user_id.as_deref() };
    let reader = PortfolioReader::new(&services.store);
    let portfolio = {
        let system = services.config.read().system.clone();
        reader.read(scope, portfolio_leader_key, system.initial_bankroll_micros)?
    };

    if group.source_type != SourceType::Buffer
        && effective.sizing.min_leader_trade_notional_micros > 0
        && group.total_notional_micros < Amount::from_i64(effective.sizing.min_leader_trade_notional_micros)
    {
        return Ok(Decision::Skip);
    }

    let shadow_exposure = match group.followed_user_id.as_deref() {
        Some(leader) => reader.shadow_leader_exposure(leader)?,
        None => 0,
    };
    let sizing_input =
        SizingInput { group, sizing: &effective.sizing, equity_micros: portfolio.equity_micros, shadow_leader_exposure_micros: shadow_exposure };
    let result = sizing::size_trade(&sizing_input);
    if result.skip.is_some() {
        return Ok(Decision::Skip);
    }

    let is_reducing = reader.is_reducing_exposure(scope, portfolio_leader_key, &group.token_id, group.side)?;
    let current_exposure_for_leader =
        group.followed_user_id.as_deref().and_then(|id| portfolio.exposure_by_leader.get(id)).copied().unwrap_or(0);
    let outcome = sizing::enforce_budget(
        &effective.sizing,
        result.target_notional_micros,
        is_reducing,
        &BudgetEnforcementInput {
            budget_usdc_micros: effective.sizing.budget_usdc_micros,
            current_exposure_for_leader_micros: current_exposure_for_leader,
            min_trade_notional_micros: effective.sizing.min_trade_notional_micros,
        },
    );
    let target_notional_micros = match outcome {
        BudgetOutcome::Skip(_) => return Ok(Decision::Skip),
        BudgetOutcome::Capped(t) | BudgetOutcome::Unchanged(t) => t,
    };

    let lookup = services.book.get_book(&group.token_id, 2_000, 500).await;
    let Some(book) = lookup.book else {
        return Ok(Decision::Skip);
    };
    let their_reference_price_micros = group.vwap_price_micros;
    let best_price_micros = match group.side {
        crate::model::Side::Buy => book.best_ask_micros,
        crate::model::Side::Sell => book.best_bid_micros,
    };
    let bounds = simulate::price_bounds(
        group.side,
        their_reference_price_micros,
        book.mid_price_micros,
        effective.guardrails.max_worsening_vs_their_fill_micros,
        effective.guardrails.max_over_mid_micros,
    );
    let target_shares = simulate::target_share_micros(&target_notional_micros, best_price_micros);
    let sim = simulate::simulate_fill_for_target_shares(group.side, &book, &bounds, &target_shares);

    let reasons = guardrails::evaluate(&GuardrailInput {
        side: group.side,
        asset_id: &group.token_id,
        followed_user_id: group.followed_user_id.as_deref(),
        sim: &sim,
        target_notional_micros: &target_notional_micros,
        their_reference_price_micros,
        guardrails: &effective.guardrails,
        portfolio: &portfolio,
        scope,
        is_reducing_exposure: is_reducing,
    });

    Ok(if reasons.is_empty() { Decision::Execute } else { Decision::Skip })
}

fn persist_skip(
    services: &Services,
    group: &TradeEventGroup,
    scope: PortfolioScope,
    reasons: Vec<ReasonCode>,
    target_notional_micros: Amount,
) -> Result<CopyAttempt, PersistenceError> {
    let attempt = CopyAttempt {
        id: uuid::Uuid::new_v4().to_string(),
        portfolio_scope: scope,
        followed_user_id: group.followed_user_id.clone(),
        group_key: group.group_key.clone(),
        decision: Decision::Skip,
        reason_codes: reasons,
        source_type: group.source_type,
        buffered_trade_count: group.buffered_trade_count,
        target_notional_micros,
        filled_notional_micros: Amount::zero(),
        filled_share_micros: Amount::zero(),
        vwap_price_micros: 0,
        filled_ratio_bps: 0,
        their_reference_price_micros: group.vwap_price_micros,
        mid_price_micros_at_decision: 0,
        created_at: chrono::Utc::now(),
    };
    services.store.upsert_copy_attempt(&attempt)?;
    Ok(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::model::{Amount, Side};
    use chrono::Utc;

    fn group(total_notional: i64, vwap: i64) -> TradeEventGroup {
        TradeEventGroup {
            group_key: "leader-1:tok:BUY:2026-01-01T00:00:00Z".to_string(),
            followed_user_id: Some("leader-1".to_string()),
            token_id: "tok".to_string(),
            side: Side::Buy,
            total_notional_micros: Amount::from_i64(total_notional),
            total_share_micros: micros::shares_from_notional(&Amount::from_i64(total_notional), vwap),
            vwap_price_micros: vwap,
            source_type: SourceType::Immediate,
            buffered_trade_count: 1,
            window_start: Utc::now(),
            contributing_event_ids: vec!["e1".to_string()],
        }
    }

    #[tokio::test]
    async fn min_leader_notional_filter_skips_before_sizing() {
        let store = Store::open_in_memory().unwrap();
        let mut config = ConfigStore::default();
        config.sizing.min_leader_trade_notional_micros = 10_000_000;
        let services = Services { book: test_book_service().await, store, config: Arc::new(RwLock::new(config)) };
        let g = group(5_000_000, 500_000);
        let attempt = execute_group(&services, &g, PortfolioScope::ExecUser, false).await.unwrap();
        assert_eq!(attempt.decision, Decision::Skip);
        assert_eq!(attempt.reason_codes, vec![ReasonCode::LeaderTradeBelowMinNotional]);
    }

    async fn test_book_service() -> Arc<BookService> {
        let (service, _ws, _sweep) = BookService::new(
            "wss://example.invalid/ws".to_string(),
            "https://example.invalid".to_string(),
            Store::open_in_memory().unwrap(),
        );
        Arc::new(service)
    }
}
