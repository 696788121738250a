//! Market-data websocket client (SPEC_FULL.md §4.1 "WS client state
//! machine"). Grounded on the teacher's `SubscriptionManager`/
//! `run_ws_loop`/`connect_and_stream` in `scrapers/polymarket_book_store.rs`:
//! same pending/active subscription bookkeeping and reconnect-with-backoff
//! shape, rewritten against the new `BookCache`/`Amount` model.

use crate::book::cache::{BookCache, SubscriptionCommand};
use crate::book::delta::{apply_level_update, rebuild_book};
use crate::error::BookServiceError;
use crate::model::{Amount, BookSource, PriceLevel};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 60_000;
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WsLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct WsBookMsg {
    event_type: String,
    asset_id: String,
    #[serde(default)]
    bids: Vec<WsLevel>,
    #[serde(default)]
    asks: Vec<WsLevel>,
}

pub struct WsClientConfig {
    pub url: String,
}

/// Per-token sorted price->size levels, merged into from each `"book"`
/// message. Keeping this persistent (rather than rebuilding from an empty
/// `Vec` per message) is what makes a future delta-style event type safe to
/// add without a partial book wiping out untouched levels.
type TokenLevels = (Vec<PriceLevel>, Vec<PriceLevel>);

pub struct WsClient {
    config: WsClientConfig,
    cache: Arc<BookCache>,
    books: Mutex<HashMap<String, TokenLevels>>,
}

impl WsClient {
    pub fn new(config: WsClientConfig, cache: Arc<BookCache>) -> Self {
        WsClient { config, cache, books: Mutex::new(HashMap::new()) }
    }

    /// Runs forever: connects, streams book deltas into the cache, and
    /// reconnects with exponential backoff (±10% jitter, capped at 60s) on
    /// any disconnect. `commands` carries subscribe/unsubscribe requests
    /// emitted by the cache's LRU/TTL sweep and by `get_book` misses.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<SubscriptionCommand>) {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut subscribed: HashSet<String> = HashSet::new();

        loop {
            match self.connect_and_stream(&mut commands, &mut subscribed).await {
                Ok(()) => {
                    info!("ws client: closed cleanly, reconnecting");
                    backoff_ms = INITIAL_BACKOFF_MS;
                }
                Err(err) => {
                    warn!(error = %err, backoff_ms, "ws client: connection failed, backing off");
                    let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
                    let jittered = (backoff_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
                    tokio::time::sleep(Duration::from_millis(jittered)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        commands: &mut mpsc::UnboundedReceiver<SubscriptionCommand>,
        subscribed: &mut HashSet<String>,
    ) -> anyhow::Result<()> {
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&self.config.url))
            .await
            .map_err(|_| BookServiceError::ConnectTimeout(CONNECT_TIMEOUT.as_millis() as u64))??;
        let (mut write, mut read) = stream.split();

        if !subscribed.is_empty() {
            send_initial_subscribe(&mut write, subscribed.iter()).await?;
        }

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        let mut awaiting_pong = false;
        let mut pong_deadline = tokio::time::Instant::now() + PONG_TIMEOUT;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(SubscriptionCommand::Subscribe(token_id)) => {
                            if subscribed.insert(token_id.clone()) {
                                send_subscribe(&mut write, &token_id).await?;
                            }
                        }
                        Some(SubscriptionCommand::Unsubscribe(token_id)) => {
                            if subscribed.remove(&token_id) {
                                send_unsubscribe(&mut write, &token_id).await?;
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                    awaiting_pong = true;
                    pong_deadline = tokio::time::Instant::now() + PONG_TIMEOUT;
                }
                _ = tokio::time::sleep_until(pong_deadline), if awaiting_pong => {
                    anyhow::bail!("pong timeout after {:?}", PONG_TIMEOUT);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.eq_ignore_ascii_case("PONG") {
                                awaiting_pong = false;
                            } else {
                                self.handle_text(&text);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// `"book"` is the only event type the core acts on: it carries the
    /// complete per-token level set, so it's merged into this client's
    /// persistent state (replacing the prior snapshot) and then rebuilt.
    /// `price_change` and `last_trade_price` are ignored per §6.1.
    fn handle_text(&self, text: &str) {
        let msg: WsBookMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(_) => return,
        };
        if msg.event_type != "book" {
            return;
        }

        let mut books = self.books.lock();
        let (bids, asks) = books.entry(msg.asset_id.clone()).or_insert_with(|| (Vec::new(), Vec::new()));
        bids.clear();
        asks.clear();
        for level in &msg.bids {
            if let Some((price, size)) = parse_level(level) {
                apply_level_update(bids, price, size, true);
            }
        }
        for level in &msg.asks {
            if let Some((price, size)) = parse_level(level) {
                apply_level_update(asks, price, size, false);
            }
        }

        let book = rebuild_book(&msg.asset_id, bids.clone(), asks.clone(), crate::book::cache::now_ms(), BookSource::Ws);
        drop(books);
        self.cache.update(book);
    }
}

fn parse_level(level: &WsLevel) -> Option<(i64, Amount)> {
    let price_f: f64 = level.price.parse().ok()?;
    let price_micros = (price_f * 1_000_000.0).round() as i64;
    let size = Amount::from_micros_str(&level.size).ok()?;
    Some((price_micros, size))
}

/// Initial connect-time bulk subscription: `{"type": "market", ...}`.
fn initial_subscribe_payload<'a>(token_ids: impl Iterator<Item = &'a String>) -> serde_json::Value {
    let ids: Vec<&String> = token_ids.collect();
    serde_json::json!({ "type": "market", "assets_ids": ids })
}

/// Incremental subscribe/unsubscribe frame, sent for a token added or
/// removed after the connection is already open.
fn operation_payload(token_id: &str, operation: &str) -> serde_json::Value {
    serde_json::json!({ "assets_ids": [token_id], "operation": operation })
}

async fn send_initial_subscribe<'a, S>(write: &mut S, token_ids: impl Iterator<Item = &'a String>) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let payload = initial_subscribe_payload(token_ids);
    write.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

async fn send_subscribe<S>(write: &mut S, token_id: &str) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    write.send(Message::Text(operation_payload(token_id, "subscribe").to_string())).await?;
    Ok(())
}

async fn send_unsubscribe<S>(write: &mut S, token_id: &str) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    write.send(Message::Text(operation_payload(token_id, "unsubscribe").to_string())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::cache::{BookCache, BookCacheConfig};

    #[test]
    fn parse_level_converts_decimal_strings_to_micros() {
        let level = WsLevel { price: "0.51".to_string(), size: "1000000".to_string() };
        let (price, size) = parse_level(&level).unwrap();
        assert_eq!(price, 510_000);
        assert_eq!(size, Amount::from_i64(1_000_000));
    }

    fn book_msg(event_type: &str, asset_id: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
        serde_json::json!({
            "event_type": event_type,
            "asset_id": asset_id,
            "bids": bids.iter().map(|(p, s)| serde_json::json!({"price": p, "size": s})).collect::<Vec<_>>(),
            "asks": asks.iter().map(|(p, s)| serde_json::json!({"price": p, "size": s})).collect::<Vec<_>>(),
        })
        .to_string()
    }

    #[tokio::test]
    async fn price_change_is_ignored_and_does_not_touch_the_cache() {
        let (cache, _rx) = BookCache::new(BookCacheConfig::default());
        let client = WsClient::new(WsClientConfig { url: "wss://example.invalid".to_string() }, cache.clone());

        client.handle_text(&book_msg("book", "tok", &[("0.40", "1000000")], &[("0.60", "1000000")]));
        let before = cache.get_book("tok", 60_000, 10).await;

        client.handle_text(&book_msg("price_change", "tok", &[("0.99", "5000000")], &[]));
        let after = cache.get_book("tok", 60_000, 10).await;

        assert_eq!(before.book.unwrap().bids, after.book.unwrap().bids);
    }

    #[tokio::test]
    async fn later_book_snapshot_fully_replaces_persisted_levels() {
        let (cache, _rx) = BookCache::new(BookCacheConfig::default());
        let client = WsClient::new(WsClientConfig { url: "wss://example.invalid".to_string() }, cache.clone());

        client.handle_text(&book_msg(
            "book",
            "tok",
            &[("0.40", "1000000"), ("0.39", "2000000")],
            &[("0.60", "1000000")],
        ));
        client.handle_text(&book_msg("book", "tok", &[("0.41", "3000000")], &[("0.61", "1000000")]));

        let lookup = cache.get_book("tok", 60_000, 10).await;
        let book = lookup.book.unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price_micros, 410_000);
    }

    #[test]
    fn incremental_subscribe_uses_operation_keyed_frame() {
        let payload = operation_payload("tok", "subscribe");
        assert_eq!(payload["operation"], "subscribe");
        assert_eq!(payload["assets_ids"][0], "tok");
        assert!(payload.get("type").is_none());
    }

    #[test]
    fn incremental_unsubscribe_uses_operation_keyed_frame() {
        let payload = operation_payload("tok", "unsubscribe");
        assert_eq!(payload["operation"], "unsubscribe");
    }

    #[test]
    fn initial_subscribe_uses_type_market_frame() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let payload = initial_subscribe_payload(ids.iter());
        assert_eq!(payload["type"], "market");
        assert_eq!(payload["assets_ids"], serde_json::json!(["a", "b"]));
        assert!(payload.get("operation").is_none());
    }
}
