//! Orderbook delta application (SPEC_FULL.md §4.1 "Delta application").
//!
//! Grounded on `apply_level_update` in the teacher's
//! `scrapers/polymarket_book_store.rs`, generalized from `f64` price/size to
//! `PriceMicros`/`Amount`.

use crate::model::{Amount, Book, BookSource, PriceLevel, PriceMicros, MICRO};

/// Set `price`'s size to `size`; remove the level if `size == 0`. `is_bid`
/// picks the sort order levels are kept in (descending for bids, ascending
/// for asks) so callers never have to re-sort on read.
pub fn apply_level_update(levels: &mut Vec<PriceLevel>, price: PriceMicros, size: Amount, is_bid: bool) {
    if let Some(idx) = levels.iter().position(|l| l.price_micros == price) {
        if size.is_zero() {
            levels.remove(idx);
        } else {
            levels[idx].size_micros = size;
        }
        return;
    }
    if size.is_zero() {
        return;
    }
    let insert_at = if is_bid {
        levels.partition_point(|l| l.price_micros > price)
    } else {
        levels.partition_point(|l| l.price_micros < price)
    };
    levels.insert(insert_at, PriceLevel { price_micros: price, size_micros: size });
}

/// Rebuild best bid/ask/mid/spread from the current level sets, dropping
/// out-of-range prices. `[0, 1_000_000]` exclusive bounds per spec.
pub fn rebuild_book(
    token_id: &str,
    mut bids: Vec<PriceLevel>,
    mut asks: Vec<PriceLevel>,
    updated_at_ms: i64,
    source: BookSource,
) -> Book {
    bids.retain(|l| l.price_micros > 0 && l.price_micros < MICRO);
    asks.retain(|l| l.price_micros > 0 && l.price_micros < MICRO);
    bids.sort_by(|a, b| b.price_micros.cmp(&a.price_micros));
    asks.sort_by(|a, b| a.price_micros.cmp(&b.price_micros));

    let best_bid = bids.first().map(|l| l.price_micros).unwrap_or(0);
    let best_ask = asks.first().map(|l| l.price_micros).unwrap_or(MICRO);
    let mid = round_div(best_bid + best_ask, 2);
    let spread = best_ask - best_bid;

    Book {
        token_id: token_id.to_string(),
        bids,
        asks,
        best_bid_micros: best_bid,
        best_ask_micros: best_ask,
        mid_price_micros: mid,
        spread_micros: spread,
        updated_at_ms,
        source,
    }
}

fn round_div(numerator: i64, denominator: i64) -> i64 {
    let q = numerator.div_euclid(denominator);
    let r = numerator.rem_euclid(denominator);
    if r * 2 >= denominator {
        q + 1
    } else {
        q
    }
}
