//! Core entities of the execution pipeline (SPEC_FULL.md §3).

use super::micros::{Amount, Bps, PriceMicros};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which proxy portfolio a decision is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortfolioScope {
    ExecGlobal,
    ExecUser,
    ShadowUser,
}

impl PortfolioScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioScope::ExecGlobal => "EXEC_GLOBAL",
            PortfolioScope::ExecUser => "EXEC_USER",
            PortfolioScope::ShadowUser => "SHADOW_USER",
        }
    }
}

impl fmt::Display for PortfolioScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceType {
    Immediate,
    Buffer,
    Aggregator,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Immediate => "IMMEDIATE",
            SourceType::Buffer => "BUFFER",
            SourceType::Aggregator => "AGGREGATOR",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Execute,
    Skip,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Execute => "EXECUTE",
            Decision::Skip => "SKIP",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    TradeFill,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TradeFill => "TRADE_FILL",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed, string-valued reason-code vocabulary (SPEC_FULL.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    PriceWorseThanTheirFill,
    PriceTooFarOverMid,
    MaxBuyCostExceeded,
    SpreadTooWide,
    InsufficientDepth,
    NoLiquidityWithinBounds,
    LeaderTradeBelowMinNotional,
    BelowMinTradeNotional,
    BelowMinExecNotional,
    BudgetHardCapExceeded,
    RiskCapUser,
    RiskCapGlobal,
    CircuitBreakerTripped,
    MergeSplitNotApplicable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::PriceWorseThanTheirFill => "PRICE_WORSE_THAN_THEIR_FILL",
            ReasonCode::PriceTooFarOverMid => "PRICE_TOO_FAR_OVER_MID",
            ReasonCode::MaxBuyCostExceeded => "MAX_BUY_COST_EXCEEDED",
            ReasonCode::SpreadTooWide => "SPREAD_TOO_WIDE",
            ReasonCode::InsufficientDepth => "INSUFFICIENT_DEPTH",
            ReasonCode::NoLiquidityWithinBounds => "NO_LIQUIDITY_WITHIN_BOUNDS",
            ReasonCode::LeaderTradeBelowMinNotional => "LEADER_TRADE_BELOW_MIN_NOTIONAL",
            ReasonCode::BelowMinTradeNotional => "BELOW_MIN_TRADE_NOTIONAL",
            ReasonCode::BelowMinExecNotional => "BELOW_MIN_EXEC_NOTIONAL",
            ReasonCode::BudgetHardCapExceeded => "BUDGET_HARD_CAP_EXCEEDED",
            ReasonCode::RiskCapUser => "RISK_CAP_USER",
            ReasonCode::RiskCapGlobal => "RISK_CAP_GLOBAL",
            ReasonCode::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            ReasonCode::MergeSplitNotApplicable => "MERGE_SPLIT_NOT_APPLICABLE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A followed wallet; owned and curated externally, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowedUser {
    pub id: String,
    pub address: String,
    pub label: Option<String>,
}

/// One detected leader fill, before aggregation. Not persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTradeEvent {
    pub id: String,
    pub followed_user_id: String,
    pub asset_id: String,
    pub raw_token_id: Option<String>,
    pub market_id: String,
    pub side: Side,
    pub price_micros: PriceMicros,
    pub share_micros: Amount,
    pub notional_micros: Amount,
    pub detect_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
}

impl PendingTradeEvent {
    /// `tokenId = rawTokenId ?? assetId` (SPEC_FULL §4.2).
    pub fn token_id(&self) -> &str {
        self.raw_token_id.as_deref().unwrap_or(&self.asset_id)
    }
}

/// An activity event (merge/split/redeem) sharing the window discipline of
/// trade events but producing no fills (SPEC_FULL §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingActivityEvent {
    pub id: String,
    pub followed_user_id: String,
    pub activity_type: String,
    pub asset_ids: Vec<String>,
    pub detect_time: DateTime<Utc>,
}

/// Aggregated batch of `PendingTradeEvent`s sharing (leader, token, side) in
/// one 2 s window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEventGroup {
    pub group_key: String,
    pub followed_user_id: Option<String>,
    pub token_id: String,
    pub side: Side,
    pub total_notional_micros: Amount,
    pub total_share_micros: Amount,
    pub vwap_price_micros: PriceMicros,
    pub source_type: SourceType,
    pub buffered_trade_count: u32,
    pub window_start: DateTime<Utc>,
    pub contributing_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSource {
    Ws,
    Rest,
}

impl fmt::Display for BookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookSource::Ws => "WS",
            BookSource::Rest => "REST",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price_micros: PriceMicros,
    pub size_micros: Amount,
}

/// Current top-of-book snapshot for one outcome token, owned exclusively by
/// the book cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub token_id: String,
    /// Sorted descending by price.
    pub bids: Vec<PriceLevel>,
    /// Sorted ascending by price.
    pub asks: Vec<PriceLevel>,
    pub best_bid_micros: PriceMicros,
    pub best_ask_micros: PriceMicros,
    pub mid_price_micros: PriceMicros,
    pub spread_micros: PriceMicros,
    pub updated_at_ms: i64,
    pub source: BookSource,
}

impl Book {
    /// An uninitialized placeholder, per SPEC_FULL §3: defaults `(0,
    /// 1_000_000)` with `updatedAt = 0`.
    pub fn placeholder(token_id: impl Into<String>) -> Self {
        Book {
            token_id: token_id.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            best_bid_micros: 0,
            best_ask_micros: crate::model::micros::MICRO,
            mid_price_micros: crate::model::micros::MICRO / 2,
            spread_micros: crate::model::micros::MICRO,
            updated_at_ms: 0,
            source: BookSource::Ws,
        }
    }

    pub fn is_fresh(&self, now_ms: i64, freshness_ms: i64) -> bool {
        self.updated_at_ms > 0 && now_ms - self.updated_at_ms < freshness_ms
    }
}

/// Durable copy-decision record, written once per `(portfolioScope,
/// groupKey)` (upsert).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyAttempt {
    pub id: String,
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub group_key: String,
    pub decision: Decision,
    pub reason_codes: Vec<ReasonCode>,
    pub source_type: SourceType,
    pub buffered_trade_count: u32,
    pub target_notional_micros: Amount,
    pub filled_notional_micros: Amount,
    pub filled_share_micros: Amount,
    pub vwap_price_micros: PriceMicros,
    pub filled_ratio_bps: i64,
    pub their_reference_price_micros: PriceMicros,
    pub mid_price_micros_at_decision: PriceMicros,
    pub created_at: DateTime<Utc>,
}

/// Per-level simulated fill, written only on EXECUTE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableFill {
    pub id: String,
    pub copy_attempt_id: String,
    pub filled_share_micros: Amount,
    pub fill_price_micros: PriceMicros,
    pub fill_notional_micros: Amount,
}

/// Double-entry-style accounting row. `cashDeltaMicros = -shareDeltaMicros *
/// priceMicros / 10^6` for trade fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub market_id: String,
    pub asset_id: String,
    pub entry_type: EntryType,
    pub share_delta_micros: Amount,
    pub cash_delta_micros: Amount,
    pub price_micros: PriceMicros,
    pub ref_id: String,
    pub created_at: DateTime<Utc>,
}

/// Sparse, externally-produced equity/exposure sample the executor reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub bucket_time: DateTime<Utc>,
    pub equity_micros: i64,
    pub exposure_micros: i64,
    pub cash_micros: i64,
}

/// Latest mark price per asset, used to value open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPriceSnapshot {
    pub asset_id: String,
    pub bucket_time: DateTime<Utc>,
    pub midpoint_price_micros: PriceMicros,
}

/// The aggregated view the executor reads to evaluate risk caps
/// (SPEC_FULL §4.4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioState {
    pub equity_micros: i64,
    pub total_exposure_micros: i64,
    pub exposure_by_market: HashMap<String, i64>,
    pub exposure_by_leader: HashMap<String, i64>,
    pub peak_equity_micros: i64,
    pub daily_pnl_micros: i64,
    pub weekly_pnl_micros: i64,
}

/// Basis-point clamp applied during sizing; kept alongside the target so the
/// executor can record *why* a target ended up where it did.
#[derive(Debug, Clone, Default)]
pub struct SizingOutcome {
    pub target_notional_micros: Amount,
    pub clamped_by_bankroll: bool,
    pub clamped_to_min: bool,
    pub clamped_to_max: bool,
    pub budget_capped: bool,
    pub rate_clamped_to_min: bool,
    pub rate_clamped_to_max: bool,
}

/// Result of the book-walk fill simulation (SPEC_FULL §4.4.6).
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub filled_share_micros: Amount,
    pub filled_notional_micros: Amount,
    pub vwap_filled_micros: PriceMicros,
    pub filled_ratio_bps: Bps,
    pub available_notional_micros: Amount,
    pub fills: Vec<ExecutableFill>,
    pub mid_price_micros: PriceMicros,
    pub spread_micros: PriceMicros,
}
