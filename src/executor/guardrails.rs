//! Guardrail checks (SPEC_FULL.md §4.4.7).
//!
//! Grounded on the teacher's `risk.rs::RiskManager` (ordered, independently
//! named rejection checks collected into one report) and the reject-path
//! conditions in `vault/execution.rs::PaperExecutionAdapter`.

use crate::config::GuardrailsConfig;
use crate::model::{micros, Amount, PortfolioScope, PortfolioState, PriceMicros, ReasonCode, Side, SimulationResult};

pub struct GuardrailInput<'a> {
    pub side: Side,
    pub asset_id: &'a str,
    pub followed_user_id: Option<&'a str>,
    pub sim: &'a SimulationResult,
    pub target_notional_micros: &'a Amount,
    pub their_reference_price_micros: PriceMicros,
    pub guardrails: &'a GuardrailsConfig,
    pub portfolio: &'a PortfolioState,
    pub scope: PortfolioScope,
    /// SELL on a current long, or BUY on a current short, for this
    /// `(scope, leader, asset)`. Bypasses circuit breakers and exposure caps.
    pub is_reducing_exposure: bool,
}

/// Runs every check in §4.4.7 order and returns the de-duplicated reason set.
/// EXECUTE iff the result is empty.
pub fn evaluate(input: &GuardrailInput) -> Vec<ReasonCode> {
    let mut reasons = Vec::new();
    let g = input.guardrails;
    let sim = input.sim;

    if input.side == Side::Buy {
        if let Some(max_cost) = g.max_buy_cost_per_share_micros {
            if sim.vwap_filled_micros > max_cost {
                reasons.push(ReasonCode::MaxBuyCostExceeded);
            }
        }
    }

    if sim.spread_micros > g.max_spread_micros {
        reasons.push(ReasonCode::SpreadTooWide);
    }

    let min_depth = micros::bps_of_amount(input.target_notional_micros, g.min_depth_multiplier_bps);
    if sim.available_notional_micros < min_depth {
        reasons.push(ReasonCode::InsufficientDepth);
    }

    if !sim.filled_share_micros.is_zero() {
        match input.side {
            Side::Buy => {
                if sim.vwap_filled_micros > input.their_reference_price_micros + g.max_worsening_vs_their_fill_micros {
                    reasons.push(ReasonCode::PriceWorseThanTheirFill);
                }
                if sim.vwap_filled_micros > sim.mid_price_micros + g.max_over_mid_micros {
                    reasons.push(ReasonCode::PriceTooFarOverMid);
                }
            }
            Side::Sell => {
                if sim.vwap_filled_micros < input.their_reference_price_micros - g.max_worsening_vs_their_fill_micros {
                    reasons.push(ReasonCode::PriceWorseThanTheirFill);
                }
                if sim.vwap_filled_micros < sim.mid_price_micros - g.max_over_mid_micros {
                    reasons.push(ReasonCode::PriceTooFarOverMid);
                }
            }
        }
    }

    if !input.is_reducing_exposure {
        let equity = input.portfolio.equity_micros;
        if equity <= 0 {
            reasons.push(ReasonCode::CircuitBreakerTripped);
        } else {
            if input.portfolio.daily_pnl_micros < -micros::bps_of_i64(equity, g.daily_loss_limit_bps) {
                reasons.push(ReasonCode::CircuitBreakerTripped);
            }
            if input.portfolio.weekly_pnl_micros < -micros::bps_of_i64(equity, g.weekly_loss_limit_bps) {
                reasons.push(ReasonCode::CircuitBreakerTripped);
            }
            let peak = input.portfolio.peak_equity_micros;
            if peak - equity > micros::bps_of_i64(peak, g.max_drawdown_limit_bps) {
                reasons.push(ReasonCode::CircuitBreakerTripped);
            }
        }
    }

    if !input.is_reducing_exposure {
        let equity = input.portfolio.equity_micros;
        let new_exposure = sim.filled_notional_micros.to_i64_saturating();
        let scope_reason = if input.scope == PortfolioScope::ExecGlobal { ReasonCode::RiskCapGlobal } else { ReasonCode::RiskCapUser };

        if input.portfolio.total_exposure_micros + new_exposure > micros::bps_of_i64(equity, g.max_total_exposure_bps) {
            reasons.push(scope_reason);
        }

        let per_market = input.portfolio.exposure_by_market.get(input.asset_id).copied().unwrap_or(0);
        if per_market + new_exposure > micros::bps_of_i64(equity, g.max_exposure_per_market_bps) {
            reasons.push(scope_reason);
        }

        if input.scope == PortfolioScope::ExecGlobal {
            let per_leader = input
                .followed_user_id
                .and_then(|id| input.portfolio.exposure_by_leader.get(id))
                .copied()
                .unwrap_or(0);
            if per_leader + new_exposure > micros::bps_of_i64(equity, g.max_exposure_per_user_bps) {
                reasons.push(ReasonCode::RiskCapGlobal);
            }
        }
    }

    if sim.filled_share_micros.is_zero() {
        reasons.push(ReasonCode::NoLiquidityWithinBounds);
    }

    reasons.sort_by_key(|r| r.as_str());
    reasons.dedup();
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutableFill;

    fn sim(filled_shares: i64, filled_notional: i64, vwap: PriceMicros, mid: PriceMicros, spread: PriceMicros, available: i64) -> SimulationResult {
        SimulationResult {
            filled_share_micros: Amount::from_i64(filled_shares),
            filled_notional_micros: Amount::from_i64(filled_notional),
            vwap_filled_micros: vwap,
            filled_ratio_bps: 0,
            available_notional_micros: Amount::from_i64(available),
            fills: Vec::<ExecutableFill>::new(),
            mid_price_micros: mid,
            spread_micros: spread,
        }
    }

    fn base_guardrails() -> GuardrailsConfig {
        GuardrailsConfig::default()
    }

    fn base_portfolio() -> PortfolioState {
        PortfolioState { equity_micros: 1_000_000_000, peak_equity_micros: 1_000_000_000, ..Default::default() }
    }

    #[test]
    fn clean_buy_within_all_bounds_executes() {
        let s = sim(98_039, 50_000, 510_000, 505_000, 10_000, 10_000_000);
        let g = base_guardrails();
        let p = base_portfolio();
        let input = GuardrailInput {
            side: Side::Buy,
            asset_id: "tok",
            followed_user_id: Some("leader-1"),
            sim: &s,
            target_notional_micros: &Amount::from_i64(50_000),
            their_reference_price_micros: 500_000,
            guardrails: &g,
            portfolio: &p,
            scope: PortfolioScope::ExecGlobal,
            is_reducing_exposure: false,
        };
        assert!(evaluate(&input).is_empty());
    }

    #[test]
    fn s2_price_worse_than_their_fill_and_over_mid() {
        // Leader filled at 500_000, our walk fills at 530_000; maxWorsening=10_000 default.
        let s = sim(94_000, 50_000, 530_000, 505_000, 10_000, 10_000_000);
        let g = base_guardrails();
        let p = base_portfolio();
        let input = GuardrailInput {
            side: Side::Buy,
            asset_id: "tok",
            followed_user_id: Some("leader-1"),
            sim: &s,
            target_notional_micros: &Amount::from_i64(50_000),
            their_reference_price_micros: 500_000,
            guardrails: &g,
            portfolio: &p,
            scope: PortfolioScope::ExecGlobal,
            is_reducing_exposure: false,
        };
        let reasons = evaluate(&input);
        assert!(reasons.contains(&ReasonCode::PriceWorseThanTheirFill));
        assert!(reasons.contains(&ReasonCode::PriceTooFarOverMid));
    }

    #[test]
    fn s3_spread_too_wide() {
        let s = sim(98_039, 50_000, 510_000, 415_000, 30_000, 10_000_000);
        let mut g = base_guardrails();
        g.max_spread_micros = 20_000;
        let p = base_portfolio();
        let input = GuardrailInput {
            side: Side::Buy,
            asset_id: "tok",
            followed_user_id: Some("leader-1"),
            sim: &s,
            target_notional_micros: &Amount::from_i64(50_000),
            their_reference_price_micros: 500_000,
            guardrails: &g,
            portfolio: &p,
            scope: PortfolioScope::ExecGlobal,
            is_reducing_exposure: false,
        };
        assert!(evaluate(&input).contains(&ReasonCode::SpreadTooWide));
    }

    #[test]
    fn zero_fill_reports_no_liquidity() {
        let s = sim(0, 0, 0, 505_000, 10_000, 0);
        let g = base_guardrails();
        let p = base_portfolio();
        let input = GuardrailInput {
            side: Side::Buy,
            asset_id: "tok",
            followed_user_id: Some("leader-1"),
            sim: &s,
            target_notional_micros: &Amount::from_i64(50_000),
            their_reference_price_micros: 500_000,
            guardrails: &g,
            portfolio: &p,
            scope: PortfolioScope::ExecGlobal,
            is_reducing_exposure: false,
        };
        assert_eq!(evaluate(&input), vec![ReasonCode::NoLiquidityWithinBounds]);
    }

    #[test]
    fn s6_reducing_exposure_bypasses_caps_and_breakers() {
        let s = sim(98_039, 50_000, 495_000, 505_000, 10_000, 10_000_000);
        let g = base_guardrails();
        let mut p = base_portfolio();
        // Fully saturated caps and a tripped drawdown, both of which must be ignored.
        p.total_exposure_micros = p.equity_micros * 100;
        p.exposure_by_market.insert("tok".to_string(), p.equity_micros * 100);
        p.daily_pnl_micros = -p.equity_micros;
        let input = GuardrailInput {
            side: Side::Sell,
            asset_id: "tok",
            followed_user_id: Some("leader-1"),
            sim: &s,
            target_notional_micros: &Amount::from_i64(50_000),
            their_reference_price_micros: 500_000,
            guardrails: &g,
            portfolio: &p,
            scope: PortfolioScope::ExecGlobal,
            is_reducing_exposure: true,
        };
        assert!(evaluate(&input).is_empty());
    }
}
