//! Portfolio-state reader (SPEC_FULL.md §4.4.2).
//!
//! Grounded on the teacher's `vault/paper_ledger.rs` equity/exposure
//! bookkeeping, generalized from its in-memory ledger to persisted-row
//! queries against [`crate::ledger::Store`].

use crate::error::PersistenceError;
use crate::ledger::Store;
use crate::model::{PortfolioScope, PortfolioState, Side};

/// Decided per SPEC_FULL §9: shadow portfolios (non-executing leader
/// mirrors) have no bankroll concept, so a cold shadow scope is valued at a
/// large default equity rather than the system's executable bankroll.
pub const SHADOW_DEFAULT_EQUITY_MICROS: i64 = 1_000_000_000_000;

pub struct PortfolioReader<'a> {
    store: &'a Store,
}

impl<'a> PortfolioReader<'a> {
    pub fn new(store: &'a Store) -> Self {
        PortfolioReader { store }
    }

    pub fn read(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        initial_bankroll_micros: i64,
    ) -> Result<PortfolioState, PersistenceError> {
        let fallback_equity = match scope {
            PortfolioScope::ExecGlobal | PortfolioScope::ExecUser => initial_bankroll_micros,
            PortfolioScope::ShadowUser => SHADOW_DEFAULT_EQUITY_MICROS,
        };
        self.store.compute_portfolio_state(scope, followed_user_id, fallback_equity)
    }

    /// `E_L` in §4.4.4's budgeted-dynamic formula: the leader's current
    /// exposure as valued by their `SHADOW_USER` mirror.
    pub fn shadow_leader_exposure(&self, followed_user_id: &str) -> Result<i64, PersistenceError> {
        let state = self.read(PortfolioScope::ShadowUser, Some(followed_user_id), 0)?;
        Ok(state.total_exposure_micros)
    }

    /// SELL on a current long, or BUY on a current short, for
    /// `(scope, followedUserId, assetId)` (SPEC_FULL §4.4.5/§4.4.7).
    pub fn is_reducing_exposure(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        asset_id: &str,
        side: Side,
    ) -> Result<bool, PersistenceError> {
        let per_asset = self.store.net_share_deltas_by_asset(scope, followed_user_id)?;
        let current = per_asset.get(asset_id).map(|a| a.is_positive()).unwrap_or(false);
        let current_short = per_asset.get(asset_id).map(|a| a.is_negative()).unwrap_or(false);
        Ok(match side {
            Side::Sell => current,
            Side::Buy => current_short,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_global_scope_falls_back_to_initial_bankroll() {
        let store = Store::open_in_memory().unwrap();
        let reader = PortfolioReader::new(&store);
        let state = reader.read(PortfolioScope::ExecGlobal, None, 1_000_000_000).unwrap();
        assert_eq!(state.equity_micros, 1_000_000_000);
    }

    #[test]
    fn cold_shadow_scope_falls_back_to_large_default() {
        let store = Store::open_in_memory().unwrap();
        let reader = PortfolioReader::new(&store);
        let state = reader.read(PortfolioScope::ShadowUser, Some("leader-1"), 1_000_000_000).unwrap();
        assert_eq!(state.equity_micros, SHADOW_DEFAULT_EQUITY_MICROS);
    }

    #[test]
    fn sell_on_a_long_is_reducing_buy_on_a_long_is_not() {
        use crate::model::{Amount, EntryType, LedgerEntry};

        let store = Store::open_in_memory().unwrap();
        let entry = LedgerEntry {
            id: "e1".to_string(),
            portfolio_scope: PortfolioScope::ExecUser,
            followed_user_id: Some("leader-1".to_string()),
            market_id: "tok".to_string(),
            asset_id: "tok".to_string(),
            entry_type: EntryType::TradeFill,
            share_delta_micros: Amount::from_i64(10_000_000),
            cash_delta_micros: Amount::from_i64(-5_000_000),
            price_micros: 500_000,
            ref_id: "copy:1".to_string(),
            created_at: chrono::Utc::now(),
        };
        store.insert_ledger_entry_idempotent(&entry).unwrap();

        let reader = PortfolioReader::new(&store);
        assert!(reader.is_reducing_exposure(PortfolioScope::ExecUser, Some("leader-1"), "tok", Side::Sell).unwrap());
        assert!(!reader.is_reducing_exposure(PortfolioScope::ExecUser, Some("leader-1"), "tok", Side::Buy).unwrap());
    }

    #[test]
    fn flat_position_is_never_reducing() {
        let store = Store::open_in_memory().unwrap();
        let reader = PortfolioReader::new(&store);
        assert!(!reader.is_reducing_exposure(PortfolioScope::ExecUser, Some("leader-1"), "tok", Side::Buy).unwrap());
        assert!(!reader.is_reducing_exposure(PortfolioScope::ExecUser, Some("leader-1"), "tok", Side::Sell).unwrap());
    }
}
