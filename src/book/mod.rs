//! Book service (SPEC_FULL.md §4.1): WS-primary, REST-fallback orderbook
//! cache with a bounded wait discipline for callers that need a fresh book.

pub mod cache;
pub mod delta;
pub mod rest_fallback;
pub mod ws_client;

use crate::ledger::Store;
use cache::{BookCache, BookCacheConfig, BookLookup};
use rest_fallback::{Priority, RestFallbackClient};
use std::sync::Arc;
use ws_client::{WsClient, WsClientConfig};

pub struct BookService {
    pub cache: Arc<BookCache>,
    pub rest: Arc<RestFallbackClient>,
}

impl BookService {
    pub fn new(
        ws_url: String,
        rest_base_url: String,
        store: Store,
    ) -> (Self, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let (cache, command_rx) = BookCache::new(BookCacheConfig::default());
        let rest = Arc::new(RestFallbackClient::new(rest_base_url, store));

        let ws_client = WsClient::new(WsClientConfig { url: ws_url }, cache.clone());
        let ws_handle = tokio::spawn(ws_client.run(command_rx));

        let sweeper_cache = cache.clone();
        let sweep_handle = tokio::spawn(sweeper_cache.run_sweeper());

        (BookService { cache, rest }, ws_handle, sweep_handle)
    }

    /// Implements §4.1's "get book" entry point: try the cache's wait
    /// discipline first, and only fall back to a direct REST fetch if the
    /// token never freshened in time.
    pub async fn get_book(&self, token_id: &str, freshness_ms: i64, wait_ms: u64) -> BookLookup {
        self.cache.ensure_subscribed(token_id);
        let lookup = self.cache.get_book(token_id, freshness_ms, wait_ms).await;
        if !lookup.stale {
            return lookup;
        }
        match self.rest.fetch_book(token_id, Priority::Interactive).await {
            Ok(book) => {
                self.cache.update(book.clone());
                BookLookup { book: Some(book), stale: false }
            }
            Err(_) => lookup,
        }
    }

    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}
