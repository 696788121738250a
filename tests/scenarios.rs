//! End-to-end scenarios (SPEC_FULL.md §8) run against the real
//! `execute_group`/`dispatch_group` pipeline: a seeded book, an in-process
//! sqlite-backed `Store`, and a real `ConfigStore`. The sub-module unit
//! tests scattered through `src/` already cover each pipeline stage in
//! isolation with these same literal values (`simulate::tests::s1_...`,
//! `guardrails::tests::s2_...`/`s3_...`/`s6_...`, `aggregate::buffer::tests::
//! quiet_flush_after_scenario_s4`); these tests exist to confirm the stages
//! compose correctly end to end, including the ledger side effects and
//! idempotent-replay guarantee that no single stage's unit tests can see.

use chrono::Utc;
use copytrail_backend::book::cache::now_ms;
use copytrail_backend::book::BookService;
use copytrail_backend::config::{BudgetEnforcement, ConfigStore, SizingMode};
use copytrail_backend::executor::{dispatch_group, execute_group, Services};
use copytrail_backend::ledger::Store;
use copytrail_backend::model::{
    Amount, Book, BookSource, Decision, EntryType, LedgerEntry, PortfolioScope, PriceLevel, ReasonCode, Side,
    SourceType, TradeEventGroup,
};
use parking_lot::RwLock;
use std::sync::Arc;

fn temp_store() -> Store {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.sqlite3");
    // Leak the tempdir so the file survives for the test's lifetime; each
    // test gets its own process-unique path and the OS reclaims it on exit.
    std::mem::forget(dir);
    Store::open(path.to_str().unwrap()).expect("open ledger store")
}

async fn services_with_book(book: Book, config: ConfigStore) -> Services {
    let (service, _ws, _sweep) = BookService::new("wss://example.invalid/ws".to_string(), "https://example.invalid".to_string());
    service.cache.update(book);
    Services { book: Arc::new(service), store: temp_store(), config: Arc::new(RwLock::new(config)) }
}

fn book(token_id: &str, bid: i64, ask: i64, bid_size: i64, ask_size: i64, mid: i64, spread: i64) -> Book {
    Book {
        token_id: token_id.to_string(),
        bids: vec![PriceLevel { price_micros: bid, size_micros: Amount::from_i64(bid_size) }],
        asks: vec![PriceLevel { price_micros: ask, size_micros: Amount::from_i64(ask_size) }],
        best_bid_micros: bid,
        best_ask_micros: ask,
        mid_price_micros: mid,
        spread_micros: spread,
        updated_at_ms: now_ms(),
        source: BookSource::Ws,
    }
}

fn leader_group(side: Side, total_notional: i64, total_shares: i64, vwap: i64) -> TradeEventGroup {
    TradeEventGroup {
        group_key: format!("leader-1:tok:{side}:2026-01-01T00:00:00Z"),
        followed_user_id: Some("leader-1".to_string()),
        token_id: "tok".to_string(),
        side,
        total_notional_micros: Amount::from_i64(total_notional),
        total_share_micros: Amount::from_i64(total_shares),
        vwap_price_micros: vwap,
        source_type: SourceType::Immediate,
        buffered_trade_count: 1,
        window_start: Utc::now(),
        contributing_event_ids: vec!["e1".to_string()],
    }
}

/// S1 — straight execute: leader BUY 10_000_000 shares @ 500_000, ask
/// (510_000, 20_000_000), copyPctNotionalBps=100. Asserts the decision, the
/// fill numbers, *and* the ledger entry the executor is supposed to write.
#[tokio::test]
async fn s1_straight_execute_writes_matching_ledger_entry() {
    let mut config = ConfigStore::default();
    // The global $5 default floor would clamp this 1%-of-$5 copy up; S1
    // assumes a deployment with a lower floor (see sizing::tests::
    // fixed_rate_applies_copy_pct for the same override, same reason).
    config.sizing.min_trade_notional_micros = 10_000;
    let b = book("tok", 495_000, 510_000, 20_000_000, 20_000_000, 502_500, 15_000);
    let services = services_with_book(b, config).await;

    let group = leader_group(Side::Buy, 5_000_000, 10_000_000, 500_000);
    let attempt = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();

    assert_eq!(attempt.decision, Decision::Execute);
    assert!(attempt.reason_codes.is_empty());
    assert_eq!(attempt.target_notional_micros, Amount::from_i64(50_000));
    assert_eq!(attempt.vwap_price_micros, 510_000);
    assert_eq!(attempt.filled_share_micros, Amount::from_i64(98_039));
    assert_eq!(attempt.filled_notional_micros, Amount::from_i64(50_000));

    let deltas = services.store.net_share_deltas_by_asset(PortfolioScope::ExecGlobal, None).unwrap();
    assert_eq!(deltas.get("tok"), Some(&Amount::from_i64(98_039)));
}

/// S2 — leader filled at 500_000, our walk would only clear at 530_000, past
/// the default 10_000-micro worsening / 15_000-micro over-mid price bound.
/// `simulate::price_bounds` enforces that bound *during* the walk (a level
/// past it is never taken), so a book offering liquidity only beyond the
/// bound ends up a zero-fill rather than a priced-but-rejected fill —
/// `guardrails::tests::s2_price_worse_than_their_fill_and_over_mid` covers
/// the direct reason-code check against a synthetic in-bound fill; this
/// end-to-end run confirms the bound actually keeps the walk from taking
/// the worse-priced level in the first place.
#[tokio::test]
async fn s2_price_worse_than_their_fill_skips() {
    let config = ConfigStore::default();
    let b = book("tok", 525_000, 530_000, 20_000_000, 20_000_000, 527_500, 5_000);
    let services = services_with_book(b, config).await;

    let group = leader_group(Side::Buy, 5_000_000, 10_000_000, 500_000);
    let attempt = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();

    assert_eq!(attempt.decision, Decision::Skip);
    assert!(attempt.reason_codes.contains(&ReasonCode::NoLiquidityWithinBounds));
}

/// S3 — spread too wide: bid 400_000 / ask 430_000, maxSpreadMicros=20_000.
#[tokio::test]
async fn s3_spread_too_wide_skips() {
    let mut config = ConfigStore::default();
    config.guardrails.max_spread_micros = 20_000;
    let b = book("tok", 400_000, 430_000, 20_000_000, 20_000_000, 415_000, 30_000);
    let services = services_with_book(b, config).await;

    let group = leader_group(Side::Buy, 5_000_000, 10_000_000, 415_000);
    let attempt = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();

    assert_eq!(attempt.decision, Decision::Skip);
    assert!(attempt.reason_codes.contains(&ReasonCode::SpreadTooWide));
}

/// S6 — reducing-exposure bypass: a leader SELL against a +200_000_000
/// share long position must ignore fully saturated exposure caps and a
/// tripped circuit breaker, but still needs real liquidity to fill.
#[tokio::test]
async fn s6_reducing_exposure_bypasses_saturated_caps() {
    let mut config = ConfigStore::default();
    config.guardrails.max_total_exposure_bps = 1;
    config.guardrails.max_exposure_per_market_bps = 1;
    config.guardrails.max_exposure_per_user_bps = 1;
    config.guardrails.daily_loss_limit_bps = 1;
    let b = book("tok", 495_000, 510_000, 20_000_000, 20_000_000, 502_500, 15_000);
    let services = services_with_book(b, config).await;

    // Seed a +200_000_000-share long position for EXEC_USER/leader-1/tok.
    let open = LedgerEntry {
        id: "seed-1".to_string(),
        portfolio_scope: PortfolioScope::ExecUser,
        followed_user_id: Some("leader-1".to_string()),
        market_id: "tok".to_string(),
        asset_id: "tok".to_string(),
        entry_type: EntryType::TradeFill,
        share_delta_micros: Amount::from_i64(200_000_000),
        cash_delta_micros: Amount::from_i64(-100_000_000_000),
        price_micros: 500_000,
        ref_id: "copy:seed-1".to_string(),
        created_at: Utc::now(),
    };
    services.store.insert_ledger_entry_idempotent(&open).unwrap();

    let group = leader_group(Side::Sell, 5_000_000, 10_000_000, 495_000);
    let attempt = execute_group(&services, &group, PortfolioScope::ExecUser, false).await.unwrap();

    assert_eq!(attempt.decision, Decision::Execute, "reasons: {:?}", attempt.reason_codes);
    assert!(attempt.reason_codes.is_empty());
}

/// §8 "Idempotence": replaying `execute_group` for the same `(scope,
/// groupKey)` must not write a second `CopyAttempt`, fill set, or ledger
/// entry — it should return the original decision untouched.
#[tokio::test]
async fn idempotent_replay_writes_no_duplicate_ledger_effect() {
    let config = ConfigStore::default();
    let b = book("tok", 495_000, 510_000, 20_000_000, 20_000_000, 502_500, 15_000);
    let services = services_with_book(b, config).await;

    let group = leader_group(Side::Buy, 50_000_000, 100_000_000, 500_000);
    let first = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();
    assert_eq!(first.decision, Decision::Execute);

    let second = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.filled_share_micros, first.filled_share_micros);

    // The net position reflects exactly one fill, not two.
    let deltas = services.store.net_share_deltas_by_asset(PortfolioScope::ExecGlobal, None).unwrap();
    assert_eq!(deltas.get("tok"), Some(&first.filled_share_micros));

    let attempts = services.store.list_copy_attempts(10).unwrap();
    assert_eq!(attempts.iter().filter(|a| a.group_key == group.group_key).count(), 1);
}

/// `(portfolioScope, followedUserId, groupKey)` uniqueness at the store
/// layer: a second upsert for the same key updates the existing row rather
/// than creating a new one, and keeps the original row id.
#[tokio::test]
async fn group_key_uniqueness_enforced_at_store_level() {
    let store = temp_store();
    let make = |id: &str, decision: Decision| copytrail_backend::model::CopyAttempt {
        id: id.to_string(),
        portfolio_scope: PortfolioScope::ExecGlobal,
        followed_user_id: None,
        group_key: "leader-1:tok:BUY:2026-01-01T00:00:00Z".to_string(),
        decision,
        reason_codes: vec![],
        source_type: SourceType::Immediate,
        buffered_trade_count: 1,
        target_notional_micros: Amount::from_i64(1),
        filled_notional_micros: Amount::zero(),
        filled_share_micros: Amount::zero(),
        vwap_price_micros: 0,
        filled_ratio_bps: 0,
        their_reference_price_micros: 0,
        mid_price_micros_at_decision: 0,
        created_at: Utc::now(),
    };

    store.upsert_copy_attempt(&make("first", Decision::Skip)).unwrap();
    store.upsert_copy_attempt(&make("second", Decision::Execute)).unwrap();

    let attempts = store.list_copy_attempts(10).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].id, "first");
    assert_eq!(attempts[0].decision, Decision::Execute);
}

/// `dispatch_group` fans one leader group out to all three portfolio scopes,
/// and the shadow mirror bypasses sizing/guardrails entirely (it exists
/// only to track the leader's own exposure).
#[tokio::test]
async fn dispatch_runs_all_scopes_and_shadow_mirrors_the_raw_trade() {
    let config = ConfigStore::default();
    let b = book("tok", 495_000, 510_000, 20_000_000, 20_000_000, 502_500, 15_000);
    let services = services_with_book(b, config).await;

    let group = leader_group(Side::Buy, 5_000_000, 10_000_000, 500_000);
    let attempts = dispatch_group(&services, &group).await;
    assert_eq!(attempts.len(), 3);

    let shadow = attempts.iter().find(|a| a.portfolio_scope == PortfolioScope::ShadowUser).unwrap();
    assert_eq!(shadow.target_notional_micros, group.total_notional_micros);
}

/// §4.4.5 budget hard cap, exercised through the full pipeline rather than
/// `sizing::enforce_budget` in isolation: headroom under the configured
/// floor must SKIP with `BUDGET_HARD_CAP_EXCEEDED` even though the book has
/// ample liquidity. Literal values are scaled down from SPEC_FULL §8's S5
/// (40_000_000 / 39_500_000 / 5_000_000) because `min_trade_notional_micros`
/// backs both the sizing floor and the budget headroom floor in this
/// implementation (see sizing::tests for the exact-literal version); the
/// qualitative shape — tight headroom below the shared floor — is identical.
#[tokio::test]
async fn s5_budget_hard_cap_skips_despite_liquid_book() {
    let mut config = ConfigStore::default();
    config.sizing.sizing_mode = SizingMode::BudgetedDynamic;
    config.sizing.budgeted_dynamic_enabled = true;
    config.sizing.budget_enforcement = BudgetEnforcement::Hard;
    config.sizing.budget_usdc_micros = 400_000;
    config.sizing.min_trade_notional_micros = 50_000;
    config.sizing.budget_r_max_bps = 100;
    let b = book("tok", 495_000, 510_000, 20_000_000, 20_000_000, 502_500, 15_000);
    let services = services_with_book(b, config).await;

    // EXEC_GLOBAL-scope exposure for leader-1 at 395_000 (no market price
    // snapshot is seeded, so compute_portfolio_state values the position at
    // its MICRO/2 = 500_000 fallback price), leaving 5_000 of headroom
    // against the 400_000 budget — below the 50_000 floor.
    let existing = LedgerEntry {
        id: "seed-2".to_string(),
        portfolio_scope: PortfolioScope::ExecGlobal,
        followed_user_id: Some("leader-1".to_string()),
        market_id: "tok".to_string(),
        asset_id: "tok".to_string(),
        entry_type: EntryType::TradeFill,
        share_delta_micros: Amount::from_i64(790_000),
        cash_delta_micros: Amount::from_i64(-395_000),
        price_micros: 500_000,
        ref_id: "copy:seed-2".to_string(),
        created_at: Utc::now(),
    };
    services.store.insert_ledger_entry_idempotent(&existing).unwrap();

    let group = leader_group(Side::Buy, 5_000_000, 10_000_000, 500_000);
    let attempt = execute_group(&services, &group, PortfolioScope::ExecGlobal, false).await.unwrap();

    assert_eq!(attempt.decision, Decision::Skip);
    assert_eq!(attempt.reason_codes, vec![ReasonCode::BudgetHardCapExceeded]);
}
