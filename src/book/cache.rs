//! Book cache: LRU + TTL storage with waiter-based `get_book` wait discipline
//! (SPEC_FULL.md §4.1).
//!
//! Grounded on the teacher's `scrapers/polymarket_book_store.rs` (`BookStore`,
//! the watch-channel waiter pattern, the periodic stale sweep), generalized
//! from an `f64`-priced book to the `Amount`/`PriceMicros` model and
//! restated per the §9 "callback-emitter coupling" note: the cache exposes
//! `ensure_subscribed`/`mark_unsubscribed` plus a command channel, rather
//! than calling into the WS client directly.

use crate::model::Book;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct BookCacheConfig {
    pub max_active_books: usize,
    pub book_ttl_ms: i64,
    pub sweep_interval_ms: u64,
    pub default_freshness_ms: i64,
}

impl Default for BookCacheConfig {
    fn default() -> Self {
        BookCacheConfig {
            max_active_books: 200,
            book_ttl_ms: 10 * 60 * 1000,
            sweep_interval_ms: 30_000,
            default_freshness_ms: 2_000,
        }
    }
}

/// Emitted to the WS client when the cache wants a subscription change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    Subscribe(String),
    Unsubscribe(String),
}

struct Waiter {
    freshness_ms: i64,
    sender: oneshot::Sender<Book>,
}

struct TokenBookState {
    book: Book,
    last_touched_ms: i64,
    waiters: Vec<Waiter>,
}

struct CacheInner {
    entries: HashMap<String, TokenBookState>,
}

pub struct BookLookup {
    pub book: Option<Book>,
    pub stale: bool,
}

pub struct BookCache {
    config: BookCacheConfig,
    inner: Mutex<CacheInner>,
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl BookCache {
    /// Returns the cache and the receiver end of its subscription-command
    /// channel; exactly one consumer (the WS client) should drain it.
    pub fn new(config: BookCacheConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SubscriptionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(BookCache {
            config,
            inner: Mutex::new(CacheInner { entries: HashMap::new() }),
            commands: tx,
        });
        (cache, rx)
    }

    fn ensure_entry<'a>(&self, inner: &'a mut CacheInner, token_id: &str, now: i64) -> &'a mut TokenBookState {
        if !inner.entries.contains_key(token_id) {
            inner.entries.insert(
                token_id.to_string(),
                TokenBookState {
                    book: Book::placeholder(token_id),
                    last_touched_ms: now,
                    waiters: Vec::new(),
                },
            );
            let _ = self.commands.send(SubscriptionCommand::Subscribe(token_id.to_string()));
        }
        inner.entries.get_mut(token_id).unwrap()
    }

    pub fn ensure_subscribed(&self, token_id: &str) {
        let now = now_ms();
        let mut inner = self.inner.lock();
        self.ensure_entry(&mut inner, token_id, now);
    }

    /// Implements the §4.1 "Wait discipline": returns immediately if fresh,
    /// otherwise subscribes and waits up to `wait_ms` for a fresh update.
    pub async fn get_book(&self, token_id: &str, freshness_ms: i64, wait_ms: u64) -> BookLookup {
        let now = now_ms();
        let receiver = {
            let mut inner = self.inner.lock();
            let entry = self.ensure_entry(&mut inner, token_id, now);
            entry.last_touched_ms = now;
            if entry.book.is_fresh(now, freshness_ms) {
                return BookLookup { book: Some(entry.book.clone()), stale: false };
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(Waiter { freshness_ms, sender: tx });
            rx
        };

        match tokio::time::timeout(Duration::from_millis(wait_ms), receiver).await {
            Ok(Ok(book)) => BookLookup { book: Some(book), stale: false },
            _ => {
                let inner = self.inner.lock();
                match inner.entries.get(token_id) {
                    Some(entry) => {
                        let stale = !entry.book.is_fresh(now_ms(), freshness_ms);
                        let book = if entry.book.updated_at_ms > 0 { Some(entry.book.clone()) } else { None };
                        BookLookup { book, stale }
                    }
                    None => BookLookup { book: None, stale: true },
                }
            }
        }
    }

    /// Applies a freshly-rebuilt book, resolving every waiter whose
    /// freshness threshold the update satisfies.
    pub fn update(&self, book: Book) {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(book.token_id.clone()).or_insert_with(|| TokenBookState {
            book: Book::placeholder(&book.token_id),
            last_touched_ms: now,
            waiters: Vec::new(),
        });
        entry.book = book.clone();
        entry.last_touched_ms = now;

        let mut remaining = Vec::with_capacity(entry.waiters.len());
        for waiter in entry.waiters.drain(..) {
            if book.is_fresh(now, waiter.freshness_ms) {
                let _ = waiter.sender.send(book.clone());
            } else {
                remaining.push(waiter);
            }
        }
        entry.waiters = remaining;
    }

    /// Periodic TTL sweep + LRU eviction, driven by a background task on
    /// `config.sweep_interval_ms`.
    pub fn sweep(&self) {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, s)| now - s.last_touched_ms > self.config.book_ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for token_id in &stale {
            inner.entries.remove(token_id);
            let _ = self.commands.send(SubscriptionCommand::Unsubscribe(token_id.clone()));
            debug!(token_id, "book cache: TTL-evicted");
        }

        if inner.entries.len() > self.config.max_active_books {
            let mut by_age: Vec<(String, i64)> =
                inner.entries.iter().map(|(k, s)| (k.clone(), s.last_touched_ms)).collect();
            by_age.sort_by_key(|(_, t)| *t);
            let overflow = inner.entries.len() - self.config.max_active_books;
            for (token_id, _) in by_age.into_iter().take(overflow) {
                inner.entries.remove(&token_id);
                let _ = self.commands.send(SubscriptionCommand::Unsubscribe(token_id.clone()));
                debug!(token_id, "book cache: LRU-evicted");
            }
        }
    }

    pub fn active_token_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        loop {
            interval.tick().await;
            self.sweep();
        }
    }

    /// Force-unsubscribe everything the cache currently holds, per the
    /// shutdown contract in SPEC_FULL §5.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        for token_id in inner.entries.keys() {
            let _ = self.commands.send(SubscriptionCommand::Unsubscribe(token_id.clone()));
        }
        inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookSource, PriceLevel};

    fn book(token_id: &str, bid: i64, ask: i64, updated_at_ms: i64) -> Book {
        Book {
            token_id: token_id.to_string(),
            bids: vec![PriceLevel { price_micros: bid, size_micros: crate::model::Amount::from_i64(1) }],
            asks: vec![PriceLevel { price_micros: ask, size_micros: crate::model::Amount::from_i64(1) }],
            best_bid_micros: bid,
            best_ask_micros: ask,
            mid_price_micros: (bid + ask) / 2,
            spread_micros: ask - bid,
            updated_at_ms,
            source: BookSource::Ws,
        }
    }

    #[tokio::test]
    async fn get_book_returns_immediately_when_fresh() {
        let (cache, _rx) = BookCache::new(BookCacheConfig::default());
        cache.update(book("tok", 490_000, 510_000, now_ms()));
        let lookup = cache.get_book("tok", 2_000, 500).await;
        assert!(!lookup.stale);
        assert!(lookup.book.is_some());
    }

    #[tokio::test]
    async fn get_book_subscribes_and_times_out_on_unknown_token() {
        let (cache, mut rx) = BookCache::new(BookCacheConfig::default());
        let lookup = cache.get_book("unknown", 2_000, 50).await;
        assert!(lookup.book.is_none());
        assert!(lookup.stale);
        assert_eq!(rx.try_recv().unwrap(), SubscriptionCommand::Subscribe("unknown".to_string()));
    }

    #[tokio::test]
    async fn get_book_waiter_resolves_on_update() {
        let (cache, _rx) = BookCache::new(BookCacheConfig::default());
        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move { cache2.get_book("tok", 2_000, 1_000).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.update(book("tok", 490_000, 510_000, now_ms()));
        let lookup = waiter.await.unwrap();
        assert!(!lookup.stale);
        assert!(lookup.book.is_some());
    }

    #[test]
    fn sweep_evicts_ttl_expired_entries_and_unsubscribes() {
        let config = BookCacheConfig { book_ttl_ms: 10, ..BookCacheConfig::default() };
        let (cache, mut rx) = BookCache::new(config);
        cache.update(book("tok", 490_000, 510_000, now_ms() - 1_000));
        cache.sweep();
        assert_eq!(cache.active_token_count(), 0);
        let mut saw_unsub = false;
        while let Ok(cmd) = rx.try_recv() {
            if cmd == SubscriptionCommand::Unsubscribe("tok".to_string()) {
                saw_unsub = true;
            }
        }
        assert!(saw_unsub);
    }
}
