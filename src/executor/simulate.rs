//! Book-walk fill simulation (SPEC_FULL.md §4.4.6).
//!
//! Grounded on `vault/execution.rs::PaperExecutionAdapter` (partial fill via
//! available size, slippage bound by price, zero-fill as a distinct outcome)
//! and the sorted `PriceLevel` vectors produced by `book::delta::rebuild_book`.

use crate::model::{micros, Amount, Book, ExecutableFill, PriceMicros, Side, SimulationResult};

pub struct PriceBounds {
    pub max_price_micros: Option<PriceMicros>,
    pub min_price_micros: Option<PriceMicros>,
}

/// BUY: `min(theirRef + maxWorsening, mid + maxOverMid)`.
/// SELL: `max(theirRef - maxWorsening, mid - maxOverMid)`.
pub fn price_bounds(
    side: Side,
    their_reference_price_micros: PriceMicros,
    mid_price_micros: PriceMicros,
    max_worsening_vs_their_fill_micros: i64,
    max_over_mid_micros: i64,
) -> PriceBounds {
    match side {
        Side::Buy => PriceBounds {
            max_price_micros: Some(
                (their_reference_price_micros + max_worsening_vs_their_fill_micros).min(mid_price_micros + max_over_mid_micros),
            ),
            min_price_micros: None,
        },
        Side::Sell => PriceBounds {
            max_price_micros: None,
            min_price_micros: Some(
                (their_reference_price_micros - max_worsening_vs_their_fill_micros).max(mid_price_micros - max_over_mid_micros),
            ),
        },
    }
}

/// `targetShareMicros = target * 10^6 / max(vwapPriceMicros, 1)`. The price
/// basis is the book's current best price on the execution side (best ask
/// for BUY, best bid for SELL) — the only price estimate available before
/// the walk runs — not the leader's own group vwap, which was already spent
/// sizing the notional target upstream.
pub fn target_share_micros(target_notional_micros: &Amount, best_price_micros: PriceMicros) -> Amount {
    micros::shares_from_notional(target_notional_micros, best_price_micros.max(1))
}

pub fn simulate_fill_for_target_shares(
    side: Side,
    book: &Book,
    bounds: &PriceBounds,
    target_share_micros: &Amount,
) -> SimulationResult {
    let levels = match side {
        Side::Buy => &book.asks,
        Side::Sell => &book.bids,
    };

    let mut remaining = target_share_micros.clone();
    let mut filled_share_micros = Amount::zero();
    let mut filled_notional_micros = Amount::zero();
    let mut available_notional_micros = Amount::zero();
    let mut fills: Vec<ExecutableFill> = Vec::new();

    for level in levels {
        let in_bounds = match side {
            Side::Buy => bounds.max_price_micros.map(|max| level.price_micros <= max).unwrap_or(true),
            Side::Sell => bounds.min_price_micros.map(|min| level.price_micros >= min).unwrap_or(true),
        };
        if !in_bounds {
            break;
        }

        available_notional_micros = &available_notional_micros + &micros::notional_from_shares(&level.size_micros, level.price_micros);

        if remaining.is_zero() {
            continue;
        }
        let take = remaining.min(&level.size_micros);
        if take.is_zero() {
            continue;
        }
        let take_notional = micros::notional_from_shares(&take, level.price_micros);
        filled_share_micros = &filled_share_micros + &take;
        filled_notional_micros = &filled_notional_micros + &take_notional;
        fills.push(ExecutableFill {
            id: uuid::Uuid::new_v4().to_string(),
            copy_attempt_id: String::new(),
            filled_share_micros: take.clone(),
            fill_price_micros: level.price_micros,
            fill_notional_micros: take_notional,
        });
        remaining = &remaining - &take;
    }

    let vwap_filled_micros = micros::vwap_price(&filled_notional_micros, &filled_share_micros);
    let filled_ratio_bps = micros::ratio_bps(&filled_share_micros, target_share_micros);

    SimulationResult {
        filled_share_micros,
        filled_notional_micros,
        vwap_filled_micros,
        filled_ratio_bps,
        available_notional_micros,
        fills,
        mid_price_micros: book.mid_price_micros,
        spread_micros: book.spread_micros,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookSource, PriceLevel};

    fn book_s1() -> Book {
        Book {
            token_id: "tok".to_string(),
            bids: vec![PriceLevel { price_micros: 495_000, size_micros: Amount::from_i64(20_000_000) }],
            asks: vec![PriceLevel { price_micros: 510_000, size_micros: Amount::from_i64(20_000_000) }],
            best_bid_micros: 495_000,
            best_ask_micros: 510_000,
            mid_price_micros: 502_500,
            spread_micros: 15_000,
            updated_at_ms: 1,
            source: BookSource::Ws,
        }
    }

    #[test]
    fn s1_straight_execute_matches_scenario_numbers() {
        let book = book_s1();
        let bounds = price_bounds(Side::Buy, 500_000, book.mid_price_micros, 10_000, 15_000);
        let target = Amount::from_i64(50_000);
        let target_shares = target_share_micros(&target, 510_000);
        let result = simulate_fill_for_target_shares(Side::Buy, &book, &bounds, &target_shares);
        assert_eq!(result.vwap_filled_micros, 510_000);
        // 50_000 * 1e6 / 510_000 = 98_039.2156... truncated to 98_039 shares requested,
        // fully filled from the single 20M-share ask level.
        assert_eq!(result.filled_share_micros, target_shares);
        assert_eq!(result.filled_notional_micros, Amount::from_i64(50_000));
    }

    #[test]
    fn fill_stops_at_price_bound_leaving_partial_fill() {
        let mut book = book_s1();
        book.asks = vec![
            PriceLevel { price_micros: 505_000, size_micros: Amount::from_i64(1_000_000) },
            PriceLevel { price_micros: 530_000, size_micros: Amount::from_i64(50_000_000) },
        ];
        let bounds = price_bounds(Side::Buy, 500_000, book.mid_price_micros, 10_000, 15_000);
        let target_shares = Amount::from_i64(10_000_000);
        let result = simulate_fill_for_target_shares(Side::Buy, &book, &bounds, &target_shares);
        // Second level's 530_000 exceeds the 510_000 bound (500_000+10_000 vs mid+15_000 = 517_500), so only the first level fills.
        assert_eq!(result.filled_share_micros, Amount::from_i64(1_000_000));
        assert!(result.available_notional_micros < micros::notional_from_shares(&Amount::from_i64(51_000_000), 505_000));
    }

    #[test]
    fn zero_liquidity_book_yields_zero_fill() {
        let mut book = book_s1();
        book.asks.clear();
        let bounds = price_bounds(Side::Buy, 500_000, book.mid_price_micros, 10_000, 15_000);
        let target_shares = Amount::from_i64(10_000_000);
        let result = simulate_fill_for_target_shares(Side::Buy, &book, &bounds, &target_shares);
        assert!(result.filled_share_micros.is_zero());
        assert_eq!(result.vwap_filled_micros, 0);
    }
}
