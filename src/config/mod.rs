//! Configuration surface (SPEC_FULL.md §6.2, §9 "Dynamic Zod schemas" note).
//!
//! Each top-level section is an explicit struct with its own `merge_partial`
//! that applies a `serde_json::Value` object field-by-field: unknown fields
//! are ignored, a type mismatch on a known field rejects the whole section.
//! Per-leader overrides are plain `Option<T>` fields on `LeaderOverrides`;
//! `None` means "inherit from global".

use crate::error::ConfigError;
use crate::model::Amount;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn merge_field<T: for<'de> Deserialize<'de>>(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    target: &mut T,
    section: &str,
) -> Result<(), ConfigError> {
    if let Some(v) = obj.get(key) {
        if v.is_null() {
            return Ok(());
        }
        *target = serde_json::from_value(v.clone()).map_err(|_| {
            ConfigError::InvalidSection(format!("{section}.{key} has the wrong type"))
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailsConfig {
    pub max_worsening_vs_their_fill_micros: i64,
    pub max_buy_cost_per_share_micros: Option<i64>,
    pub max_over_mid_micros: i64,
    pub max_spread_micros: i64,
    pub min_depth_multiplier_bps: i64,
    /// Inert per Open Question #2: the executor does not consult this field.
    pub no_new_opens_within_minutes_to_close: i64,
    pub decision_latency_ms: u64,
    pub jitter_ms_max: u64,
    pub max_total_exposure_bps: i64,
    pub max_exposure_per_market_bps: i64,
    pub max_exposure_per_user_bps: i64,
    pub daily_loss_limit_bps: i64,
    pub weekly_loss_limit_bps: i64,
    pub max_drawdown_limit_bps: i64,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        GuardrailsConfig {
            max_worsening_vs_their_fill_micros: 10_000,
            max_buy_cost_per_share_micros: None,
            max_over_mid_micros: 15_000,
            max_spread_micros: 20_000,
            min_depth_multiplier_bps: 12_500,
            no_new_opens_within_minutes_to_close: 30,
            decision_latency_ms: 0,
            jitter_ms_max: 0,
            max_total_exposure_bps: 7_000,
            max_exposure_per_market_bps: 500,
            max_exposure_per_user_bps: 2_000,
            daily_loss_limit_bps: 300,
            weekly_loss_limit_bps: 800,
            max_drawdown_limit_bps: 1_200,
        }
    }
}

impl GuardrailsConfig {
    pub fn merge_partial(&mut self, patch: &Value) -> Result<(), ConfigError> {
        let Some(obj) = patch.as_object() else {
            return Err(ConfigError::InvalidSection("guardrails must be an object".into()));
        };
        merge_field(obj, "maxWorseningVsTheirFillMicros", &mut self.max_worsening_vs_their_fill_micros, "guardrails")?;
        merge_field(obj, "maxBuyCostPerShareMicros", &mut self.max_buy_cost_per_share_micros, "guardrails")?;
        merge_field(obj, "maxOverMidMicros", &mut self.max_over_mid_micros, "guardrails")?;
        merge_field(obj, "maxSpreadMicros", &mut self.max_spread_micros, "guardrails")?;
        merge_field(obj, "minDepthMultiplierBps", &mut self.min_depth_multiplier_bps, "guardrails")?;
        merge_field(obj, "noNewOpensWithinMinutesToClose", &mut self.no_new_opens_within_minutes_to_close, "guardrails")?;
        merge_field(obj, "decisionLatencyMs", &mut self.decision_latency_ms, "guardrails")?;
        merge_field(obj, "jitterMsMax", &mut self.jitter_ms_max, "guardrails")?;
        merge_field(obj, "maxTotalExposureBps", &mut self.max_total_exposure_bps, "guardrails")?;
        merge_field(obj, "maxExposurePerMarketBps", &mut self.max_exposure_per_market_bps, "guardrails")?;
        merge_field(obj, "maxExposurePerUserBps", &mut self.max_exposure_per_user_bps, "guardrails")?;
        merge_field(obj, "dailyLossLimitBps", &mut self.daily_loss_limit_bps, "guardrails")?;
        merge_field(obj, "weeklyLossLimitBps", &mut self.weekly_loss_limit_bps, "guardrails")?;
        merge_field(obj, "maxDrawdownLimitBps", &mut self.max_drawdown_limit_bps, "guardrails")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMode {
    FixedRate,
    BudgetedDynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetEnforcement {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizingConfig {
    pub copy_pct_notional_bps: i64,
    pub min_trade_notional_micros: i64,
    pub max_trade_notional_micros: i64,
    pub max_trade_bankroll_bps: i64,
    pub sizing_mode: SizingMode,
    pub budgeted_dynamic_enabled: bool,
    pub budget_usdc_micros: i64,
    pub budget_r_min_bps: i64,
    pub budget_r_max_bps: i64,
    pub budget_enforcement: BudgetEnforcement,
    pub min_leader_trade_notional_micros: i64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        SizingConfig {
            copy_pct_notional_bps: 100,
            min_trade_notional_micros: 5_000_000,
            max_trade_notional_micros: 250_000_000,
            max_trade_bankroll_bps: 75,
            sizing_mode: SizingMode::FixedRate,
            budgeted_dynamic_enabled: false,
            budget_usdc_micros: 0,
            budget_r_min_bps: 0,
            budget_r_max_bps: 100,
            budget_enforcement: BudgetEnforcement::Soft,
            min_leader_trade_notional_micros: 0,
        }
    }
}

impl SizingConfig {
    pub fn merge_partial(&mut self, patch: &Value) -> Result<(), ConfigError> {
        let Some(obj) = patch.as_object() else {
            return Err(ConfigError::InvalidSection("sizing must be an object".into()));
        };
        merge_field(obj, "copyPctNotionalBps", &mut self.copy_pct_notional_bps, "sizing")?;
        merge_field(obj, "minTradeNotionalMicros", &mut self.min_trade_notional_micros, "sizing")?;
        merge_field(obj, "maxTradeNotionalMicros", &mut self.max_trade_notional_micros, "sizing")?;
        merge_field(obj, "maxTradeBankrollBps", &mut self.max_trade_bankroll_bps, "sizing")?;
        merge_field(obj, "sizingMode", &mut self.sizing_mode, "sizing")?;
        merge_field(obj, "budgetedDynamicEnabled", &mut self.budgeted_dynamic_enabled, "sizing")?;
        merge_field(obj, "budgetUsdcMicros", &mut self.budget_usdc_micros, "sizing")?;
        merge_field(obj, "budgetRMinBps", &mut self.budget_r_min_bps, "sizing")?;
        merge_field(obj, "budgetRMaxBps", &mut self.budget_r_max_bps, "sizing")?;
        merge_field(obj, "budgetEnforcement", &mut self.budget_enforcement, "sizing")?;
        merge_field(obj, "minLeaderTradeNotionalMicros", &mut self.min_leader_trade_notional_micros, "sizing")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NettingMode {
    SameSideOnly,
    NetBuySell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmallTradeBufferingConfig {
    pub enabled: bool,
    pub notional_threshold_micros: i64,
    pub flush_min_notional_micros: i64,
    pub min_exec_notional_micros: i64,
    pub max_buffer_ms: u64,
    pub quiet_flush_ms: u64,
    pub netting_mode: NettingMode,
}

impl Default for SmallTradeBufferingConfig {
    fn default() -> Self {
        SmallTradeBufferingConfig {
            enabled: true,
            notional_threshold_micros: 250_000,
            flush_min_notional_micros: 500_000,
            min_exec_notional_micros: 100_000,
            max_buffer_ms: 2_500,
            quiet_flush_ms: 600,
            netting_mode: NettingMode::SameSideOnly,
        }
    }
}

impl SmallTradeBufferingConfig {
    pub fn merge_partial(&mut self, patch: &Value) -> Result<(), ConfigError> {
        let Some(obj) = patch.as_object() else {
            return Err(ConfigError::InvalidSection("smallTradeBuffering must be an object".into()));
        };
        merge_field(obj, "enabled", &mut self.enabled, "smallTradeBuffering")?;
        merge_field(obj, "notionalThresholdMicros", &mut self.notional_threshold_micros, "smallTradeBuffering")?;
        merge_field(obj, "flushMinNotionalMicros", &mut self.flush_min_notional_micros, "smallTradeBuffering")?;
        merge_field(obj, "minExecNotionalMicros", &mut self.min_exec_notional_micros, "smallTradeBuffering")?;
        merge_field(obj, "maxBufferMs", &mut self.max_buffer_ms, "smallTradeBuffering")?;
        merge_field(obj, "quietFlushMs", &mut self.quiet_flush_ms, "smallTradeBuffering")?;
        merge_field(obj, "nettingMode", &mut self.netting_mode, "smallTradeBuffering")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub copy_engine_enabled: bool,
    pub aggregation_window_ms: u64,
    pub initial_bankroll_micros: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            copy_engine_enabled: true,
            aggregation_window_ms: 2_000,
            initial_bankroll_micros: 1_000_000_000,
        }
    }
}

impl SystemConfig {
    pub fn merge_partial(&mut self, patch: &Value) -> Result<(), ConfigError> {
        let Some(obj) = patch.as_object() else {
            return Err(ConfigError::InvalidSection("system must be an object".into()));
        };
        merge_field(obj, "copyEngineEnabled", &mut self.copy_engine_enabled, "system")?;
        merge_field(obj, "aggregationWindowMs", &mut self.aggregation_window_ms, "system")?;
        merge_field(obj, "initialBankrollMicros", &mut self.initial_bankroll_micros, "system")?;
        Ok(())
    }
}

/// Global defaults plus per-leader overrides (leader wins, missing fields
/// inherit). Guarded by a single `RwLock` (single-owner per SPEC_FULL §5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderOverrides {
    pub guardrails: Option<Value>,
    pub sizing: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub guardrails: GuardrailsConfig,
    pub sizing: SizingConfig,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    pub guardrails: GuardrailsConfig,
    pub sizing: SizingConfig,
    pub small_trade_buffering: SmallTradeBufferingConfig,
    pub system: SystemConfig,
    pub leader_overrides: HashMap<String, LeaderOverrides>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        ConfigStore {
            guardrails: GuardrailsConfig::default(),
            sizing: SizingConfig::default(),
            small_trade_buffering: SmallTradeBufferingConfig::default(),
            system: SystemConfig::default(),
            leader_overrides: HashMap::new(),
        }
    }
}

impl ConfigStore {
    /// Resolve the effective guardrails/sizing for a leader: override field
    /// present and non-null wins, otherwise inherit the global value.
    pub fn effective_for(&self, followed_user_id: Option<&str>) -> Result<EffectiveConfig, ConfigError> {
        let mut guardrails = self.guardrails.clone();
        let mut sizing = self.sizing.clone();
        if let Some(id) = followed_user_id {
            if let Some(overrides) = self.leader_overrides.get(id) {
                if let Some(patch) = &overrides.guardrails {
                    guardrails.merge_partial(patch)?;
                }
                if let Some(patch) = &overrides.sizing {
                    sizing.merge_partial(patch)?;
                }
            }
        }
        Ok(EffectiveConfig { guardrails, sizing })
    }
}

/// Process-start bootstrap: venue endpoints, storage location, bind address.
/// Failure here is a programmer/operator error and the process exits
/// (SPEC_FULL §7 "Programmer error" row).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub market_ws_url: String,
    pub rest_base_url: String,
    pub database_path: String,
    pub bind_addr: String,
    pub initial_bankroll_micros: Amount,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let market_ws_url = std::env::var("MARKET_WS_URL")
            .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string());
        let rest_base_url = std::env::var("REST_BASE_URL")
            .unwrap_or_else(|_| "https://clob.polymarket.com".to_string());
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./copytrail.db".to_string());
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let initial_bankroll_micros = std::env::var("INITIAL_BANKROLL_MICROS")
            .ok()
            .map(|v| {
                v.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
                    field: "INITIAL_BANKROLL_MICROS".into(),
                    value: v,
                })
            })
            .transpose()?
            .unwrap_or(1_000_000_000);

        Ok(AppConfig {
            market_ws_url,
            rest_base_url,
            database_path,
            bind_addr,
            initial_bankroll_micros: Amount::from_i64(initial_bankroll_micros),
        })
    }
}
