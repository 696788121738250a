//! SQLite schema (SPEC_FULL.md §6.3/§6.4), applied idempotently at startup.
//!
//! Grounded on the teacher's `signals/db_storage.rs` (`CREATE TABLE IF NOT
//! EXISTS` script + `PRAGMA journal_mode=WAL`). The nullable
//! `(portfolioScope, followedUserId, groupKey)` compound unique is solved
//! per §9's "null -> sentinel" note: a global-scope row's `followed_user_id`
//! is stored as `''` rather than `NULL`, so a plain `UNIQUE` index applies.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS copy_attempts (
    id                              TEXT PRIMARY KEY,
    portfolio_scope                 TEXT NOT NULL,
    followed_user_id                TEXT NOT NULL DEFAULT '',
    group_key                       TEXT NOT NULL,
    decision                        TEXT NOT NULL,
    reason_codes                    TEXT NOT NULL,
    source_type                     TEXT NOT NULL,
    buffered_trade_count            INTEGER NOT NULL,
    target_notional_micros          TEXT NOT NULL,
    filled_notional_micros          TEXT NOT NULL,
    filled_share_micros             TEXT NOT NULL,
    vwap_price_micros               INTEGER NOT NULL,
    filled_ratio_bps                INTEGER NOT NULL,
    their_reference_price_micros    INTEGER NOT NULL,
    mid_price_micros_at_decision    INTEGER NOT NULL,
    created_at                      TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_copy_attempts_scope_key
    ON copy_attempts (portfolio_scope, followed_user_id, group_key);

CREATE TABLE IF NOT EXISTS executable_fills (
    id                      TEXT PRIMARY KEY,
    copy_attempt_id         TEXT NOT NULL REFERENCES copy_attempts(id),
    filled_share_micros     TEXT NOT NULL,
    fill_price_micros       INTEGER NOT NULL,
    fill_notional_micros    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executable_fills_attempt
    ON executable_fills (copy_attempt_id);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id                      TEXT PRIMARY KEY,
    portfolio_scope         TEXT NOT NULL,
    followed_user_id        TEXT NOT NULL DEFAULT '',
    market_id               TEXT NOT NULL,
    asset_id                TEXT NOT NULL,
    entry_type              TEXT NOT NULL,
    share_delta_micros      TEXT NOT NULL,
    cash_delta_micros       TEXT NOT NULL,
    price_micros            INTEGER NOT NULL,
    ref_id                  TEXT NOT NULL,
    created_at               TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_idempotency
    ON ledger_entries (portfolio_scope, followed_user_id, ref_id, entry_type);

CREATE INDEX IF NOT EXISTS idx_ledger_entries_asset
    ON ledger_entries (portfolio_scope, followed_user_id, asset_id);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    portfolio_scope     TEXT NOT NULL,
    followed_user_id    TEXT NOT NULL DEFAULT '',
    bucket_time         TEXT NOT NULL,
    equity_micros       INTEGER NOT NULL,
    exposure_micros     INTEGER NOT NULL,
    cash_micros         INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_portfolio_snapshots_key
    ON portfolio_snapshots (portfolio_scope, followed_user_id, bucket_time);

CREATE TABLE IF NOT EXISTS market_price_snapshots (
    asset_id                TEXT NOT NULL,
    bucket_time             TEXT NOT NULL,
    midpoint_price_micros   INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_market_price_snapshots_key
    ON market_price_snapshots (asset_id, bucket_time);

CREATE TABLE IF NOT EXISTS resolved_tokens (
    token_id        TEXT PRIMARY KEY,
    resolved_at     TEXT NOT NULL
);
"#;
