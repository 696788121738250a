//! Persistence layer (SPEC_FULL.md §6.3/§6.4).
//!
//! Grounded on the teacher's `signals/db_storage.rs`: `rusqlite` with
//! `bundled` SQLite, WAL mode, and a single `parking_lot::Mutex<Connection>`
//! behind an `Arc` as the one allowed writer/reader handle.

use crate::error::PersistenceError;
use crate::ledger::schema::SCHEMA_SQL;
use crate::model::{
    Amount, CopyAttempt, Decision, EntryType, ExecutableFill, LedgerEntry, MarketPriceSnapshot, PortfolioScope,
    PortfolioSnapshot, PortfolioState, PriceMicros, ReasonCode, SourceType,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// `NULL` leader id is stored as this sentinel so a plain `UNIQUE` index can
/// enforce `(scope, leader, group_key)` uniqueness (SPEC_FULL §9).
const GLOBAL_SENTINEL: &str = "";

fn leader_key(followed_user_id: Option<&str>) -> &str {
    followed_user_id.unwrap_or(GLOBAL_SENTINEL)
}

fn decode_leader(raw: &str) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

impl Store {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { conn: Arc::new(Mutex::new(conn)) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn upsert_copy_attempt(&self, attempt: &CopyAttempt) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        let reason_codes_json = serde_json::to_string(&attempt.reason_codes).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            r#"INSERT INTO copy_attempts (
                id, portfolio_scope, followed_user_id, group_key, decision, reason_codes,
                source_type, buffered_trade_count, target_notional_micros, filled_notional_micros,
                filled_share_micros, vwap_price_micros, filled_ratio_bps, their_reference_price_micros,
                mid_price_micros_at_decision, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT (portfolio_scope, followed_user_id, group_key) DO UPDATE SET
                decision = excluded.decision,
                reason_codes = excluded.reason_codes,
                source_type = excluded.source_type,
                buffered_trade_count = excluded.buffered_trade_count,
                target_notional_micros = excluded.target_notional_micros,
                filled_notional_micros = excluded.filled_notional_micros,
                filled_share_micros = excluded.filled_share_micros,
                vwap_price_micros = excluded.vwap_price_micros,
                filled_ratio_bps = excluded.filled_ratio_bps,
                their_reference_price_micros = excluded.their_reference_price_micros,
                mid_price_micros_at_decision = excluded.mid_price_micros_at_decision"#,
            params![
                attempt.id,
                attempt.portfolio_scope.as_str(),
                leader_key(attempt.followed_user_id.as_deref()),
                attempt.group_key,
                attempt.decision.to_string(),
                reason_codes_json,
                attempt.source_type.as_str(),
                attempt.buffered_trade_count,
                attempt.target_notional_micros.to_string(),
                attempt.filled_notional_micros.to_string(),
                attempt.filled_share_micros.to_string(),
                attempt.vwap_price_micros,
                attempt.filled_ratio_bps,
                attempt.their_reference_price_micros,
                attempt.mid_price_micros_at_decision,
                attempt.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_fill(&self, fill: &ExecutableFill) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO executable_fills (id, copy_attempt_id, filled_share_micros, fill_price_micros, fill_notional_micros)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fill.id,
                fill.copy_attempt_id,
                fill.filled_share_micros.to_string(),
                fill.fill_price_micros,
                fill.fill_notional_micros.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Idempotent under `(scope, followedUserId, refId, entryType)`:
    /// re-running a decision never duplicates a fill's ledger row.
    pub fn insert_ledger_entry_idempotent(&self, entry: &LedgerEntry) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO ledger_entries (
                id, portfolio_scope, followed_user_id, market_id, asset_id, entry_type,
                share_delta_micros, cash_delta_micros, price_micros, ref_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id,
                entry.portfolio_scope.as_str(),
                leader_key(entry.followed_user_id.as_deref()),
                entry.market_id,
                entry.asset_id,
                entry.entry_type.as_str(),
                entry.share_delta_micros.to_string(),
                entry.cash_delta_micros.to_string(),
                entry.price_micros,
                entry.ref_id,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_portfolio_snapshot(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> Result<Option<PortfolioSnapshot>, PersistenceError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT bucket_time, equity_micros, exposure_micros, cash_micros
                 FROM portfolio_snapshots
                 WHERE portfolio_scope = ?1 AND followed_user_id = ?2
                 ORDER BY bucket_time DESC LIMIT 1",
                params![scope.as_str(), leader_key(followed_user_id)],
                |r| {
                    let bucket_time: String = r.get(0)?;
                    Ok((bucket_time, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?, r.get::<_, i64>(3)?))
                },
            )
            .optional()?;

        Ok(row.map(|(bucket_time, equity, exposure, cash)| PortfolioSnapshot {
            portfolio_scope: scope,
            followed_user_id: followed_user_id.map(|s| s.to_string()),
            bucket_time: parse_rfc3339(&bucket_time),
            equity_micros: equity,
            exposure_micros: exposure,
            cash_micros: cash,
        }))
    }

    /// Equity at or before `cutoff`, per SPEC_FULL §9's PnL-window decision:
    /// the nearest snapshot at or before the boundary, `None` if the history
    /// doesn't reach back that far.
    pub fn equity_at_or_before(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<i64>, PersistenceError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT equity_micros FROM portfolio_snapshots
             WHERE portfolio_scope = ?1 AND followed_user_id = ?2 AND bucket_time <= ?3
             ORDER BY bucket_time DESC LIMIT 1",
            params![scope.as_str(), leader_key(followed_user_id), cutoff.to_rfc3339()],
            |r| r.get(0),
        )
        .optional()
        .map_err(PersistenceError::from)
    }

    pub fn peak_equity_micros(&self, scope: PortfolioScope, followed_user_id: Option<&str>) -> Result<Option<i64>, PersistenceError> {
        let conn = self.conn.lock();
        let peak = conn
            .query_row(
                "SELECT MAX(equity_micros) FROM portfolio_snapshots WHERE portfolio_scope = ?1 AND followed_user_id = ?2",
                params![scope.as_str(), leader_key(followed_user_id)],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(peak)
    }

    pub fn latest_price_micros(&self, asset_id: &str) -> Result<Option<PriceMicros>, PersistenceError> {
        let conn = self.conn.lock();
        let price = conn
            .query_row(
                "SELECT midpoint_price_micros FROM market_price_snapshots WHERE asset_id = ?1 ORDER BY bucket_time DESC LIMIT 1",
                params![asset_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(price)
    }

    pub fn insert_market_price_snapshot(&self, snapshot: &MarketPriceSnapshot) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_price_snapshots (asset_id, bucket_time, midpoint_price_micros) VALUES (?1, ?2, ?3)
             ON CONFLICT (asset_id, bucket_time) DO UPDATE SET midpoint_price_micros = excluded.midpoint_price_micros",
            params![snapshot.asset_id, snapshot.bucket_time.to_rfc3339(), snapshot.midpoint_price_micros],
        )?;
        Ok(())
    }

    pub fn insert_portfolio_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO portfolio_snapshots (portfolio_scope, followed_user_id, bucket_time, equity_micros, exposure_micros, cash_micros)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (portfolio_scope, followed_user_id, bucket_time) DO UPDATE SET
                equity_micros = excluded.equity_micros,
                exposure_micros = excluded.exposure_micros,
                cash_micros = excluded.cash_micros",
            params![
                snapshot.portfolio_scope.as_str(),
                leader_key(snapshot.followed_user_id.as_deref()),
                snapshot.bucket_time.to_rfc3339(),
                snapshot.equity_micros,
                snapshot.exposure_micros,
                snapshot.cash_micros,
            ],
        )?;
        Ok(())
    }

    /// Net `shareDeltaMicros` per asset for `(scope, followedUserId)`, used
    /// both for exposure valuation and the "reducing exposure" sign check.
    ///
    /// `EXEC_GLOBAL` with `followedUserId = None` is the pooled book: ledger
    /// rows for that scope still carry the attributing leader's id (for
    /// audit), so a `None` lookup aggregates across every leader rather than
    /// filtering to the empty-sentinel rows.
    pub fn net_share_deltas_by_asset(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> Result<HashMap<String, Amount>, PersistenceError> {
        let conn = self.conn.lock();
        let pooled = scope == PortfolioScope::ExecGlobal && followed_user_id.is_none();
        let rows: Vec<(String, String)> = if pooled {
            let mut stmt = conn.prepare("SELECT asset_id, share_delta_micros FROM ledger_entries WHERE portfolio_scope = ?1")?;
            let rows = stmt.query_map(params![scope.as_str()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT asset_id, share_delta_micros FROM ledger_entries WHERE portfolio_scope = ?1 AND followed_user_id = ?2",
            )?;
            let rows = stmt.query_map(params![scope.as_str(), leader_key(followed_user_id)], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut totals: HashMap<String, Amount> = HashMap::new();
        for (asset_id, delta_str) in rows {
            let delta = Amount::from_micros_str(&delta_str).unwrap_or_else(Amount::zero);
            let entry = totals.entry(asset_id).or_insert_with(Amount::zero);
            *entry = &*entry + &delta;
        }
        Ok(totals)
    }

    /// Net exposure per leader within the global scope, summed across every
    /// asset at that asset's latest mark price.
    pub fn net_exposure_by_leader(&self, scope: PortfolioScope) -> Result<HashMap<String, i64>, PersistenceError> {
        let leaders: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT followed_user_id FROM ledger_entries WHERE portfolio_scope = ?1 AND followed_user_id != ''",
            )?;
            let rows = stmt.query_map(params![scope.as_str()], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut result = HashMap::new();
        for leader in leaders {
            let per_asset = self.net_share_deltas_by_asset(scope, Some(&leader))?;
            let mut total = 0i64;
            for (asset_id, shares) in per_asset {
                let price = self.latest_price_micros(&asset_id)?.unwrap_or(crate::model::MICRO / 2);
                total += crate::model::micros::notional_from_shares(&shares, price).abs().to_i64_saturating();
            }
            result.insert(leader, total);
        }
        Ok(result)
    }

    /// Assembles the full §4.4.2 `PortfolioState` for one `(scope,
    /// followedUserId)`, applying the scope-specific equity fallback.
    pub fn compute_portfolio_state(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        fallback_equity_micros: i64,
    ) -> Result<PortfolioState, PersistenceError> {
        let snapshot = self.latest_portfolio_snapshot(scope, followed_user_id)?;
        let equity_micros = snapshot.as_ref().map(|s| s.equity_micros).unwrap_or(fallback_equity_micros);
        let peak_equity_micros = self.peak_equity_micros(scope, followed_user_id)?.unwrap_or(equity_micros);

        let now = Utc::now();
        let equity_1d_ago = self.equity_at_or_before(scope, followed_user_id, now - chrono::Duration::days(1))?;
        let equity_7d_ago = self.equity_at_or_before(scope, followed_user_id, now - chrono::Duration::days(7))?;
        let daily_pnl_micros = equity_1d_ago.map(|e| equity_micros - e).unwrap_or(0);
        let weekly_pnl_micros = equity_7d_ago.map(|e| equity_micros - e).unwrap_or(0);

        let per_asset = self.net_share_deltas_by_asset(scope, followed_user_id)?;
        let mut exposure_by_market = HashMap::new();
        let mut total_exposure_micros = 0i64;
        for (asset_id, shares) in &per_asset {
            let price = self.latest_price_micros(asset_id)?.unwrap_or(crate::model::MICRO / 2);
            let notional = crate::model::micros::notional_from_shares(shares, price).abs().to_i64_saturating();
            exposure_by_market.insert(asset_id.clone(), notional);
            total_exposure_micros += notional;
        }

        let exposure_by_leader = if scope == PortfolioScope::ExecGlobal {
            self.net_exposure_by_leader(scope)?
        } else {
            HashMap::new()
        };

        Ok(PortfolioState {
            equity_micros,
            total_exposure_micros,
            exposure_by_market,
            exposure_by_leader,
            peak_equity_micros,
            daily_pnl_micros,
            weekly_pnl_micros,
        })
    }

    pub fn copy_attempt_by_scope_and_group(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        group_key: &str,
    ) -> Result<Option<(String, Decision)>, PersistenceError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, decision FROM copy_attempts WHERE portfolio_scope = ?1 AND followed_user_id = ?2 AND group_key = ?3",
                params![scope.as_str(), leader_key(followed_user_id), group_key],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, decision)| (id, if decision == "EXECUTE" { Decision::Execute } else { Decision::Skip })))
    }

    /// Full-row counterpart of `copy_attempt_by_scope_and_group`, used by the
    /// executor's idempotent-replay short-circuit (SPEC_FULL §8 "Idempotence"):
    /// a re-run of the same `(scope, groupKey)` returns the prior decision
    /// verbatim instead of re-simulating and writing a second set of fills.
    pub fn copy_attempt_full_by_scope_and_group(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        group_key: &str,
    ) -> Result<Option<CopyAttempt>, PersistenceError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, portfolio_scope, followed_user_id, group_key, decision, reason_codes, source_type,
                    buffered_trade_count, target_notional_micros, filled_notional_micros, filled_share_micros,
                    vwap_price_micros, filled_ratio_bps, their_reference_price_micros, mid_price_micros_at_decision,
                    created_at
             FROM copy_attempts WHERE portfolio_scope = ?1 AND followed_user_id = ?2 AND group_key = ?3",
            params![scope.as_str(), leader_key(followed_user_id), group_key],
            row_to_copy_attempt,
        )
        .optional()
        .map_err(PersistenceError::from)
    }

    pub fn mark_token_resolved(&self, token_id: &str) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resolved_tokens (token_id, resolved_at) VALUES (?1, ?2)
             ON CONFLICT (token_id) DO UPDATE SET resolved_at = excluded.resolved_at",
            params![token_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn is_token_resolved_since(&self, token_id: &str, since: DateTime<Utc>) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let resolved_at: Option<String> = conn
            .query_row("SELECT resolved_at FROM resolved_tokens WHERE token_id = ?1", params![token_id], |r| r.get(0))
            .optional()?;
        Ok(resolved_at.map(|ts| parse_rfc3339(&ts) > since).unwrap_or(false))
    }

    /// Token ids resolved on or after `since`, for hydrating an in-memory
    /// resolved-tokens cache on startup.
    pub fn list_resolved_tokens_since(&self, since: DateTime<Utc>) -> Result<Vec<String>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT token_id, resolved_at FROM resolved_tokens")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut ids = Vec::new();
        for row in rows {
            let (token_id, resolved_at) = row?;
            if parse_rfc3339(&resolved_at) >= since {
                ids.push(token_id);
            }
        }
        Ok(ids)
    }

    pub fn list_copy_attempts(&self, limit: i64) -> Result<Vec<CopyAttempt>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, portfolio_scope, followed_user_id, group_key, decision, reason_codes, source_type,
                    buffered_trade_count, target_notional_micros, filled_notional_micros, filled_share_micros,
                    vwap_price_micros, filled_ratio_bps, their_reference_price_micros, mid_price_micros_at_decision,
                    created_at
             FROM copy_attempts ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_copy_attempt)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    /// Paginated, asset-filtered read for `GET /api/copy-attempts`.
    /// `asset_id` matches `groupKey`'s embedded token id (`leader:token:SIDE:window`);
    /// `cursor` is the last-seen id from a previous page, per SPEC_FULL §6.5.
    pub fn list_copy_attempts_page(
        &self,
        limit: i64,
        cursor: Option<&str>,
        asset_id: Option<&str>,
    ) -> Result<(Vec<CopyAttempt>, i64), PersistenceError> {
        let conn = self.conn.lock();
        let asset_pattern = asset_id.map(|a| format!("%:{a}:%"));

        let total: i64 = match &asset_pattern {
            Some(pattern) => conn.query_row(
                "SELECT COUNT(*) FROM copy_attempts WHERE group_key LIKE ?1",
                params![pattern],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM copy_attempts", [], |r| r.get(0))?,
        };

        let cursor_created_at: Option<String> = match cursor {
            Some(id) => conn
                .query_row("SELECT created_at FROM copy_attempts WHERE id = ?1", params![id], |r| r.get(0))
                .optional()?,
            None => None,
        };

        const COLUMNS: &str = "id, portfolio_scope, followed_user_id, group_key, decision, reason_codes, source_type,
                    buffered_trade_count, target_notional_micros, filled_notional_micros, filled_share_micros,
                    vwap_price_micros, filled_ratio_bps, their_reference_price_micros, mid_price_micros_at_decision,
                    created_at";

        let items: Vec<CopyAttempt> = match (&asset_pattern, &cursor_created_at) {
            (Some(p), Some(c)) => {
                let sql = format!("SELECT {COLUMNS} FROM copy_attempts WHERE group_key LIKE ?1 AND created_at < ?2 ORDER BY created_at DESC LIMIT ?3");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![p, c, limit], row_to_copy_attempt)?.collect::<Result<_, _>>()?
            }
            (Some(p), None) => {
                let sql = format!("SELECT {COLUMNS} FROM copy_attempts WHERE group_key LIKE ?1 ORDER BY created_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![p, limit], row_to_copy_attempt)?.collect::<Result<_, _>>()?
            }
            (None, Some(c)) => {
                let sql = format!("SELECT {COLUMNS} FROM copy_attempts WHERE created_at < ?1 ORDER BY created_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![c, limit], row_to_copy_attempt)?.collect::<Result<_, _>>()?
            }
            (None, None) => {
                let sql = format!("SELECT {COLUMNS} FROM copy_attempts ORDER BY created_at DESC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![limit], row_to_copy_attempt)?.collect::<Result<_, _>>()?
            }
        };
        Ok((items, total))
    }

    /// `EXEC_GLOBAL` attempts created at or after `since`, oldest first —
    /// the replay source for `POST /api/config/test` (SPEC_FULL §6.5).
    pub fn list_copy_attempts_since(&self, scope: PortfolioScope, since: DateTime<Utc>) -> Result<Vec<CopyAttempt>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, portfolio_scope, followed_user_id, group_key, decision, reason_codes, source_type,
                    buffered_trade_count, target_notional_micros, filled_notional_micros, filled_share_micros,
                    vwap_price_micros, filled_ratio_bps, their_reference_price_micros, mid_price_micros_at_decision,
                    created_at
             FROM copy_attempts WHERE portfolio_scope = ?1 AND created_at >= ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![scope.as_str(), since.to_rfc3339()], row_to_copy_attempt)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }
}

fn row_to_copy_attempt(r: &rusqlite::Row) -> rusqlite::Result<CopyAttempt> {
    let scope_str: String = r.get(1)?;
    let decision_str: String = r.get(4)?;
    let reason_codes_str: String = r.get(5)?;
    let source_type_str: String = r.get(6)?;
    let leader: String = r.get(2)?;
    let created_at: String = r.get(15)?;

    Ok(CopyAttempt {
        id: r.get(0)?,
        portfolio_scope: parse_scope(&scope_str),
        followed_user_id: decode_leader(&leader),
        group_key: r.get(3)?,
        decision: if decision_str == "EXECUTE" { Decision::Execute } else { Decision::Skip },
        reason_codes: serde_json::from_str::<Vec<ReasonCode>>(&reason_codes_str).unwrap_or_default(),
        source_type: parse_source_type(&source_type_str),
        buffered_trade_count: r.get(7)?,
        target_notional_micros: Amount::from_micros_str(&r.get::<_, String>(8)?).unwrap_or_else(Amount::zero),
        filled_notional_micros: Amount::from_micros_str(&r.get::<_, String>(9)?).unwrap_or_else(Amount::zero),
        filled_share_micros: Amount::from_micros_str(&r.get::<_, String>(10)?).unwrap_or_else(Amount::zero),
        vwap_price_micros: r.get(11)?,
        filled_ratio_bps: r.get(12)?,
        their_reference_price_micros: r.get(13)?,
        mid_price_micros_at_decision: r.get(14)?,
        created_at: parse_rfc3339(&created_at),
    })
}

fn parse_scope(s: &str) -> PortfolioScope {
    match s {
        "EXEC_USER" => PortfolioScope::ExecUser,
        "SHADOW_USER" => PortfolioScope::ShadowUser,
        _ => PortfolioScope::ExecGlobal,
    }
}

fn parse_source_type(s: &str) -> SourceType {
    match s {
        "BUFFER" => SourceType::Buffer,
        "AGGREGATOR" => SourceType::Aggregator,
        _ => SourceType::Immediate,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Side, MICRO};

    fn sample_attempt(group_key: &str, scope: PortfolioScope) -> CopyAttempt {
        CopyAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: scope,
            followed_user_id: Some("leader-1".to_string()),
            group_key: group_key.to_string(),
            decision: Decision::Execute,
            reason_codes: vec![],
            source_type: SourceType::Immediate,
            buffered_trade_count: 1,
            target_notional_micros: Amount::from_i64(50_000),
            filled_notional_micros: Amount::from_i64(50_000),
            filled_share_micros: Amount::from_i64(98_039),
            vwap_price_micros: 510_000,
            filled_ratio_bps: 9_804,
            their_reference_price_micros: 500_000,
            mid_price_micros_at_decision: 500_000,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_copy_attempt_is_idempotent_on_scope_and_group_key() {
        let store = Store::open_in_memory().unwrap();
        let mut attempt = sample_attempt("g1", PortfolioScope::ExecUser);
        store.upsert_copy_attempt(&attempt).unwrap();
        attempt.decision = Decision::Skip;
        attempt.reason_codes = vec![ReasonCode::SpreadTooWide];
        store.upsert_copy_attempt(&attempt).unwrap();

        let rows = store.list_copy_attempts(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].decision, Decision::Skip);
    }

    #[test]
    fn ledger_entry_insert_or_ignore_prevents_duplicate_fills() {
        let store = Store::open_in_memory().unwrap();
        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: PortfolioScope::ExecGlobal,
            followed_user_id: None,
            market_id: "m1".to_string(),
            asset_id: "a1".to_string(),
            entry_type: EntryType::TradeFill,
            share_delta_micros: Amount::from_i64(1_000_000),
            cash_delta_micros: Amount::from_i64(-500_000),
            price_micros: 500_000,
            ref_id: "copy:abc".to_string(),
            created_at: Utc::now(),
        };
        store.insert_ledger_entry_idempotent(&entry).unwrap();
        store.insert_ledger_entry_idempotent(&entry).unwrap();

        let totals = store.net_share_deltas_by_asset(PortfolioScope::ExecGlobal, None).unwrap();
        assert_eq!(totals.get("a1"), Some(&Amount::from_i64(1_000_000)));
    }

    #[test]
    fn compute_portfolio_state_falls_back_to_provided_equity_when_no_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let state = store.compute_portfolio_state(PortfolioScope::ExecGlobal, None, 1_000_000_000).unwrap();
        assert_eq!(state.equity_micros, 1_000_000_000);
        assert_eq!(state.total_exposure_micros, 0);
    }

    #[test]
    fn exposure_values_use_latest_mark_price() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_market_price_snapshot(&MarketPriceSnapshot { asset_id: "a1".to_string(), bucket_time: Utc::now(), midpoint_price_micros: 600_000 })
            .unwrap();
        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            portfolio_scope: PortfolioScope::ExecGlobal,
            followed_user_id: None,
            market_id: "m1".to_string(),
            asset_id: "a1".to_string(),
            entry_type: EntryType::TradeFill,
            share_delta_micros: Amount::from_i64(2_000_000),
            cash_delta_micros: Amount::from_i64(-1_000_000),
            price_micros: 500_000,
            ref_id: "copy:xyz".to_string(),
            created_at: Utc::now(),
        };
        store.insert_ledger_entry_idempotent(&entry).unwrap();
        let state = store.compute_portfolio_state(PortfolioScope::ExecGlobal, None, 0).unwrap();
        assert_eq!(state.total_exposure_micros, 1_200_000);
        let _ = Side::Buy;
        let _ = MICRO;
    }

    #[test]
    fn list_copy_attempts_page_filters_by_asset_and_paginates_by_cursor() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_copy_attempt(&sample_attempt("leader-1:tok-a:BUY:w1", PortfolioScope::ExecGlobal)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let middle = sample_attempt("leader-1:tok-b:BUY:w1", PortfolioScope::ExecGlobal);
        store.upsert_copy_attempt(&middle).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.upsert_copy_attempt(&sample_attempt("leader-1:tok-a:SELL:w2", PortfolioScope::ExecGlobal)).unwrap();

        let (items, total) = store.list_copy_attempts_page(10, None, Some("tok-a")).unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 2);

        let (all, total_all) = store.list_copy_attempts_page(10, None, None).unwrap();
        assert_eq!(total_all, 3);
        let cursor_id = all[0].id.clone();
        let (page, _) = store.list_copy_attempts_page(10, Some(&cursor_id), None).unwrap();
        assert_eq!(page.len(), 2);
        assert!(!page.iter().any(|a| a.id == cursor_id));
    }

    #[test]
    fn list_copy_attempts_since_only_returns_matching_scope_after_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(1);
        store.upsert_copy_attempt(&sample_attempt("leader-1:tok-a:BUY:w1", PortfolioScope::ExecGlobal)).unwrap();
        store.upsert_copy_attempt(&sample_attempt("leader-1:tok-a:BUY:w1", PortfolioScope::ExecUser)).unwrap();
        let rows = store.list_copy_attempts_since(PortfolioScope::ExecGlobal, cutoff).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].portfolio_scope, PortfolioScope::ExecGlobal);
    }
}
