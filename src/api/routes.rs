//! HTTP surface (SPEC_FULL.md §6.5): portfolio/config/control read-write
//! endpoints backed by the executor's `Services`.
//!
//! Grounded on the donor's `api/routes.rs` handler shape (`Query`/`State`
//! extractors, `Json<T>` responses), generalized from its ad-hoc
//! `StatusCode` errors to `EngineError`'s `IntoResponse` mapping.

use crate::api::state::AppState;
use crate::config::{GuardrailsConfig, LeaderOverrides, SizingConfig, SmallTradeBufferingConfig, SystemConfig};
use crate::error::EngineError;
use crate::executor::dry_run_group;
use crate::model::{micros, Amount, CopyAttempt, Decision, PortfolioScope, Side, TradeEventGroup};
use axum::extract::{Path, Query, State as AxumState};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/portfolio/global", get(portfolio_global))
        .route("/api/copy-attempts", get(list_copy_attempts))
        .route("/api/config/global", get(get_config_global).post(post_config_global))
        .route("/api/config/user/:id", get(get_config_user).post(post_config_user))
        .route("/api/control/pause", post(control_pause))
        .route("/api/config/test", post(config_test))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    pub asset_id: String,
    pub share_micros: Amount,
    pub notional_micros: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioMetrics {
    pub equity: i64,
    pub cash: i64,
    pub exposure: i64,
    pub pnl: i64,
    pub pnl1h: i64,
    pub pnl24h: i64,
    pub pnl7d: i64,
    pub pnl30d: i64,
    pub exposure_pct: f64,
    pub risk_utilization_pct: f64,
    pub max_drawdown_pct: f64,
    pub current_drawdown_pct: f64,
    pub drawdown_utilization_pct: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioGlobalResponse {
    pub positions: Vec<PositionView>,
    pub exposure_by_market: HashMap<String, i64>,
    pub exposure_by_user: HashMap<String, i64>,
    pub metrics: PortfolioMetrics,
}

/// `GET /api/portfolio/global`. `PortfolioState` carries the fields the
/// executor itself consults (§4.4.2); the rest of this response is derived
/// here from that state plus the guardrail limits that bound it.
async fn portfolio_global(AxumState(state): AxumState<AppState>) -> Result<Json<PortfolioGlobalResponse>, EngineError> {
    let store = &state.services.store;
    let config = state.services.config.read();
    let system = config.system.clone();
    let guardrails = config.guardrails.clone();
    drop(config);

    let portfolio = store.compute_portfolio_state(PortfolioScope::ExecGlobal, None, system.initial_bankroll_micros)?;
    let cash_micros =
        store.latest_portfolio_snapshot(PortfolioScope::ExecGlobal, None)?.map(|s| s.cash_micros).unwrap_or(system.initial_bankroll_micros);

    let now = Utc::now();
    let equity_1h_ago = store.equity_at_or_before(PortfolioScope::ExecGlobal, None, now - chrono::Duration::hours(1))?;
    let equity_30d_ago = store.equity_at_or_before(PortfolioScope::ExecGlobal, None, now - chrono::Duration::days(30))?;
    let pnl1h = equity_1h_ago.map(|e| portfolio.equity_micros - e).unwrap_or(0);
    let pnl30d = equity_30d_ago.map(|e| portfolio.equity_micros - e).unwrap_or(0);

    let per_asset = store.net_share_deltas_by_asset(PortfolioScope::ExecGlobal, None)?;
    let mut positions = Vec::with_capacity(per_asset.len());
    for (asset_id, shares) in &per_asset {
        let price = store.latest_price_micros(asset_id)?.unwrap_or(micros::MICRO / 2);
        let notional = micros::notional_from_shares(shares, price).abs().to_i64_saturating();
        positions.push(PositionView { asset_id: asset_id.clone(), share_micros: shares.clone(), notional_micros: notional });
    }
    positions.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));

    let exposure_pct = ratio_pct(portfolio.total_exposure_micros, portfolio.equity_micros);
    let risk_utilization_pct = ratio_pct(portfolio.total_exposure_micros, bps_of(portfolio.equity_micros, guardrails.max_total_exposure_bps));
    let current_drawdown = (portfolio.peak_equity_micros - portfolio.equity_micros).max(0);
    let current_drawdown_pct = ratio_pct(current_drawdown, portfolio.peak_equity_micros);
    let max_drawdown_pct = guardrails.max_drawdown_limit_bps as f64 / 100.0;
    let drawdown_utilization_pct = if max_drawdown_pct > 0.0 { current_drawdown_pct / max_drawdown_pct * 100.0 } else { 0.0 };

    Ok(Json(PortfolioGlobalResponse {
        positions,
        exposure_by_market: portfolio.exposure_by_market.clone(),
        exposure_by_user: portfolio.exposure_by_leader.clone(),
        metrics: PortfolioMetrics {
            equity: portfolio.equity_micros,
            cash: cash_micros,
            exposure: portfolio.total_exposure_micros,
            pnl: portfolio.daily_pnl_micros,
            pnl1h,
            pnl24h: portfolio.daily_pnl_micros,
            pnl7d: portfolio.weekly_pnl_micros,
            pnl30d,
            exposure_pct,
            risk_utilization_pct,
            max_drawdown_pct,
            current_drawdown_pct,
            drawdown_utilization_pct,
        },
    }))
}

fn ratio_pct(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64 * 100.0
    }
}

fn bps_of(amount: i64, bps: i64) -> i64 {
    ((amount as i128) * (bps as i128) / 10_000) as i64
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyAttemptsQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    pub asset_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CopyAttemptsResponse {
    pub items: Vec<CopyAttempt>,
    pub total: i64,
}

async fn list_copy_attempts(
    Query(params): Query<CopyAttemptsQuery>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<CopyAttemptsResponse>, EngineError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let (items, total) =
        state.services.store.list_copy_attempts_page(limit, params.cursor.as_deref(), params.asset_id.as_deref())?;
    Ok(Json(CopyAttemptsResponse { items, total }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalConfigResponse {
    guardrails: GuardrailsConfig,
    sizing: SizingConfig,
    small_trade_buffering: SmallTradeBufferingConfig,
    system: SystemConfig,
}

async fn get_config_global(AxumState(state): AxumState<AppState>) -> Json<GlobalConfigResponse> {
    let config = state.services.config.read();
    Json(GlobalConfigResponse {
        guardrails: config.guardrails.clone(),
        sizing: config.sizing.clone(),
        small_trade_buffering: config.small_trade_buffering.clone(),
        system: config.system.clone(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalConfigPatch {
    guardrails: Option<Value>,
    sizing: Option<Value>,
    small_trade_buffering: Option<Value>,
    system: Option<Value>,
}

async fn post_config_global(
    AxumState(state): AxumState<AppState>,
    Json(patch): Json<GlobalConfigPatch>,
) -> Result<Json<GlobalConfigResponse>, EngineError> {
    let mut config = state.services.config.write();
    if let Some(p) = &patch.guardrails {
        config.guardrails.merge_partial(p)?;
    }
    if let Some(p) = &patch.sizing {
        config.sizing.merge_partial(p)?;
    }
    if let Some(p) = &patch.small_trade_buffering {
        config.small_trade_buffering.merge_partial(p)?;
    }
    if let Some(p) = &patch.system {
        config.system.merge_partial(p)?;
    }
    Ok(Json(GlobalConfigResponse {
        guardrails: config.guardrails.clone(),
        sizing: config.sizing.clone(),
        small_trade_buffering: config.small_trade_buffering.clone(),
        system: config.system.clone(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserConfigResponse {
    guardrails: Option<Value>,
    sizing: Option<Value>,
}

async fn get_config_user(AxumState(state): AxumState<AppState>, Path(id): Path<String>) -> Json<UserConfigResponse> {
    let config = state.services.config.read();
    let overrides = config.leader_overrides.get(&id).cloned().unwrap_or_default();
    Json(UserConfigResponse { guardrails: overrides.guardrails, sizing: overrides.sizing })
}

/// `guardrails`/`sizing` patches: a JSON object merges into the stored
/// override (creating one if absent), the empty string `""` clears the
/// override back to "inherit from global", and an absent field leaves the
/// existing override untouched (SPEC_FULL §6.5: "empty string means
/// inherit").
#[derive(Debug, Deserialize)]
struct UserConfigPatch {
    guardrails: Option<Value>,
    sizing: Option<Value>,
}

async fn post_config_user(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<UserConfigPatch>,
) -> Result<Json<UserConfigResponse>, EngineError> {
    let mut config = state.services.config.write();
    let overrides = config.leader_overrides.entry(id).or_insert_with(LeaderOverrides::default);
    apply_override_patch(&mut overrides.guardrails, patch.guardrails)?;
    apply_override_patch(&mut overrides.sizing, patch.sizing)?;
    Ok(Json(UserConfigResponse { guardrails: overrides.guardrails.clone(), sizing: overrides.sizing.clone() }))
}

fn apply_override_patch(stored: &mut Option<Value>, incoming: Option<Value>) -> Result<(), EngineError> {
    match incoming {
        None => {}
        Some(Value::String(s)) if s.is_empty() => *stored = None,
        Some(Value::Object(patch)) => {
            let mut base = stored.clone().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            let Value::Object(base_obj) = &mut base else { unreachable!() };
            for (k, v) in patch {
                base_obj.insert(k, v);
            }
            *stored = Some(base);
        }
        Some(_) => return Err(EngineError::BadRequest("guardrails/sizing patch must be an object or empty string".into())),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum PauseAction {
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
struct PauseRequest {
    action: PauseAction,
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    copy_engine_enabled: bool,
}

async fn control_pause(
    AxumState(state): AxumState<AppState>,
    Json(body): Json<PauseRequest>,
) -> Json<PauseResponse> {
    let mut config = state.services.config.write();
    config.system.copy_engine_enabled = body.action == PauseAction::Resume;
    Json(PauseResponse { copy_engine_enabled: config.system.copy_engine_enabled })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ConfigTestScope {
    Global,
}

#[derive(Debug, Deserialize)]
struct ConfigTestRequest {
    #[allow(dead_code)]
    scope: ConfigTestScope,
}

#[derive(Debug, Serialize)]
struct ConfigTestResponse {
    total: usize,
    executed: usize,
    skipped: usize,
}

/// `POST /api/config/test`: replays `EXEC_GLOBAL` attempts from the last
/// 24h against the *current* config. Raw `TradeEventGroup`s aren't
/// persisted, so each replayed group is reconstructed from its stored
/// `CopyAttempt` — `targetNotionalMicros` (itself already a sizing output
/// under whatever config was live at the time) stands in for the original
/// leader notional. This makes the replay approximate, not a byte-exact
/// re-run; see DESIGN.md.
async fn config_test(AxumState(state): AxumState<AppState>, Json(_body): Json<ConfigTestRequest>) -> Result<Json<ConfigTestResponse>, EngineError> {
    let since = Utc::now() - chrono::Duration::hours(24);
    let attempts = state.services.store.list_copy_attempts_since(PortfolioScope::ExecGlobal, since)?;

    let mut executed = 0usize;
    let mut skipped = 0usize;
    for attempt in &attempts {
        let group = reconstruct_group(attempt);
        match dry_run_group(&state.services, &group, PortfolioScope::ExecGlobal).await {
            Ok(Decision::Execute) => executed += 1,
            Ok(Decision::Skip) => skipped += 1,
            Err(e) => return Err(EngineError::from(e)),
        }
    }

    Ok(Json(ConfigTestResponse { total: attempts.len(), executed, skipped }))
}

fn reconstruct_group(attempt: &CopyAttempt) -> TradeEventGroup {
    let mut parts = attempt.group_key.splitn(4, ':');
    let _leader = parts.next().unwrap_or_default();
    let token_id = parts.next().unwrap_or_default().to_string();
    let side = match parts.next() {
        Some("SELL") => Side::Sell,
        _ => Side::Buy,
    };

    let total_notional_micros = attempt.target_notional_micros.clone();
    let vwap_price_micros = if attempt.their_reference_price_micros > 0 { attempt.their_reference_price_micros } else { micros::MICRO / 2 };
    let total_share_micros = micros::shares_from_notional(&total_notional_micros, vwap_price_micros);

    TradeEventGroup {
        group_key: attempt.group_key.clone(),
        followed_user_id: attempt.followed_user_id.clone(),
        token_id,
        side,
        total_notional_micros,
        total_share_micros,
        vwap_price_micros,
        source_type: attempt.source_type,
        buffered_trade_count: attempt.buffered_trade_count,
        window_start: attempt.created_at,
        contributing_event_ids: vec![attempt.id.clone()],
    }
}
