//! Sizing (SPEC_FULL.md §4.4.4/§4.4.5).
//!
//! Grounded on the teacher's `risk.rs` Kelly-style clamp chain and
//! `vault/trade_executor.rs`'s target-notional computation, generalized to
//! the two sizing modes and the budget headroom check.

use crate::config::{BudgetEnforcement, SizingConfig, SizingMode};
use crate::model::{micros, Amount, ReasonCode, SourceType, TradeEventGroup};

pub struct SizingInput<'a> {
    pub group: &'a TradeEventGroup,
    pub sizing: &'a SizingConfig,
    pub equity_micros: i64,
    /// `E_L` for budgeted-dynamic sizing: the leader's shadow-portfolio
    /// exposure. Ignored in fixed-rate mode.
    pub shadow_leader_exposure_micros: i64,
}

pub struct SizingResult {
    pub target_notional_micros: Amount,
    pub clamped_by_bankroll: bool,
    pub clamped_to_min: bool,
    pub clamped_to_max: bool,
    pub rate_clamped_to_min: bool,
    pub rate_clamped_to_max: bool,
    pub skip: Option<ReasonCode>,
}

/// Computes the raw pre-clamp target, per §4.4.4's two sizing modes.
fn raw_target(input: &SizingInput) -> (Amount, bool, bool) {
    if input.group.source_type == SourceType::Buffer {
        return (input.group.total_notional_micros.clone(), false, false);
    }

    match input.sizing.sizing_mode {
        SizingMode::FixedRate => {
            (micros::bps_of_amount(&input.group.total_notional_micros, input.sizing.copy_pct_notional_bps), false, false)
        }
        SizingMode::BudgetedDynamic => {
            let e_l = input.shadow_leader_exposure_micros;
            let budget = input.sizing.budget_usdc_micros;
            let (rate_bps, clamped_to_min, clamped_to_max) = if e_l > 0 {
                let raw_bps = (budget as i128 * 10_000 / e_l as i128) as i64;
                let min_bps = input.sizing.budget_r_min_bps;
                let max_bps = input.sizing.budget_r_max_bps;
                if raw_bps < min_bps {
                    (min_bps, true, false)
                } else if raw_bps > max_bps {
                    (max_bps, false, true)
                } else {
                    (raw_bps, false, false)
                }
            } else {
                (input.sizing.budget_r_max_bps, false, true)
            };
            (micros::bps_of_amount(&input.group.total_notional_micros, rate_bps), clamped_to_min, clamped_to_max)
        }
    }
}

/// Applies the §4.4.4 trade-level clamps. The bankroll cap is applied as
/// the final ceiling (after the `[min, max]` clamp) rather than first: this
/// is what makes the spec's own "(e.g. bankroll too small)" example for the
/// §4.4.4 step-3 SKIP reachable — a tiny bankroll can still pull a
/// min-clamped target back down below the floor.
pub fn size_trade(input: &SizingInput) -> SizingResult {
    let (raw, rate_clamped_to_min, rate_clamped_to_max) = raw_target(input);

    let min_notional = Amount::from_i64(input.sizing.min_trade_notional_micros);
    let max_notional = Amount::from_i64(input.sizing.max_trade_notional_micros);

    let mut target = raw;
    let mut clamped_to_min = false;
    let mut clamped_to_max = false;
    if target < min_notional {
        target = min_notional.clone();
        clamped_to_min = true;
    }
    if target > max_notional {
        target = max_notional;
        clamped_to_max = true;
    }

    let bankroll_cap = Amount::from_i64(micros::bps_of_i64(input.equity_micros, input.sizing.max_trade_bankroll_bps));
    let mut clamped_by_bankroll = false;
    if target > bankroll_cap {
        target = bankroll_cap;
        clamped_by_bankroll = true;
    }

    let skip = if target < min_notional { Some(ReasonCode::BelowMinTradeNotional) } else { None };

    SizingResult {
        target_notional_micros: target,
        clamped_by_bankroll,
        clamped_to_min,
        clamped_to_max,
        rate_clamped_to_min,
        rate_clamped_to_max,
        skip,
    }
}

/// §4.4.5 budget hard-cap enforcement. Only applies when budgeted-dynamic
/// sizing is active, enforcement is HARD, and the trade does not reduce
/// existing exposure.
pub struct BudgetEnforcementInput {
    pub budget_usdc_micros: i64,
    pub current_exposure_for_leader_micros: i64,
    pub min_trade_notional_micros: i64,
}

pub enum BudgetOutcome {
    Unchanged(Amount),
    Capped(Amount),
    Skip(ReasonCode),
}

pub fn enforce_budget(
    sizing: &SizingConfig,
    target: Amount,
    is_reducing_exposure: bool,
    input: &BudgetEnforcementInput,
) -> BudgetOutcome {
    let active = sizing.sizing_mode == SizingMode::BudgetedDynamic
        && sizing.budgeted_dynamic_enabled
        && sizing.budget_enforcement == BudgetEnforcement::Hard
        && !is_reducing_exposure;
    if !active {
        return BudgetOutcome::Unchanged(target);
    }

    let headroom = input.budget_usdc_micros - input.current_exposure_for_leader_micros;
    if headroom <= 0 {
        return BudgetOutcome::Skip(ReasonCode::BudgetHardCapExceeded);
    }
    if target.to_i64_saturating() > headroom {
        if headroom < input.min_trade_notional_micros {
            return BudgetOutcome::Skip(ReasonCode::BudgetHardCapExceeded);
        }
        return BudgetOutcome::Capped(Amount::from_i64(headroom));
    }
    BudgetOutcome::Unchanged(target)
}
