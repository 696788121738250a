//! Copy-trading execution simulator.
//!
//! Wires the book service, ingest pipeline, executor and the read-only HTTP
//! surface into one process. Leader-trade discovery itself is external to
//! this system (SPEC_FULL.md's system overview marks it "(external)"); this
//! binary constructs the ingest entry points (`IngestRouter`,
//! `ActivityAggregator`) that such a component would feed, and drains
//! whatever arrives on them into the executor.

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use copytrail_backend::aggregate;
use copytrail_backend::api;
use copytrail_backend::book;
use copytrail_backend::config::{AppConfig, ConfigStore};
use copytrail_backend::executor::activity::{persist_activity_group, ActivityAggregator, ActivityGroup};
use copytrail_backend::executor::{dispatch_group, persist_buffer_skip, Services};
use copytrail_backend::ledger;
use copytrail_backend::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
use copytrail_backend::middleware::request_logging;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let app_config = AppConfig::from_env().context("loading configuration")?;
    init_tracing();

    info!("copytrail starting up");

    let store = ledger::Store::open(&app_config.database_path).context("opening ledger store")?;

    let (book_service, book_ws_handle, book_sweep_handle) = book::BookService::new(
        app_config.market_ws_url.clone(),
        app_config.rest_base_url.clone(),
        store.clone(),
    );
    let book_service = Arc::new(book_service);

    let mut config_store = ConfigStore::default();
    config_store.system.initial_bankroll_micros = app_config.initial_bankroll_micros.to_i64_saturating();
    let config_store = Arc::new(RwLock::new(config_store));

    let services = Arc::new(Services { book: book_service.clone(), store, config: config_store.clone() });

    let (group_tx, mut group_rx) = mpsc::unbounded_channel();
    let (buffer_flush_tx, mut buffer_flush_rx) = mpsc::unbounded_channel();
    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();

    let buffering_snapshot = config_store.read().small_trade_buffering.clone();
    let ingest_router = Arc::new(aggregate::IngestRouter::new(&buffering_snapshot, group_tx, buffer_flush_tx));
    let activity_aggregator = ActivityAggregator::new(activity_tx);

    info!("ingest router and activity aggregator constructed; ready for an external feed to call ingest()");

    {
        let services = services.clone();
        tokio::spawn(async move {
            while let Some(group) = group_rx.recv().await {
                let attempts = dispatch_group(&services, &group).await;
                info!(group_key = %group.group_key, attempts = attempts.len(), "dispatched trade event group");
            }
        });
    }

    {
        let services = services.clone();
        tokio::spawn(async move {
            while let Some(flush) = buffer_flush_rx.recv().await {
                match flush {
                    aggregate::buffer::BufferFlush::Group(group) => {
                        let attempts = dispatch_group(&services, &group).await;
                        info!(group_key = %group.group_key, attempts = attempts.len(), "dispatched buffered trade event group");
                    }
                    skip @ aggregate::buffer::BufferFlush::SkipBelowMinExec { .. } => {
                        if let Err(e) = persist_buffer_skip(&services, skip) {
                            error!(error = %e, "persist_buffer_skip failed");
                        }
                    }
                }
            }
        });
    }

    {
        let store_services = services.clone();
        tokio::spawn(async move {
            while let Some(group) = activity_rx.recv().await {
                if let Err(e) = persist_activity_group(&store_services.store, &group) {
                    error!(error = %e, group_key = %group.group_key, "persist_activity_group failed");
                }
                log_activity_group(&group);
            }
        });
    }

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    let app = api::router(api::AppState::new(services.clone()))
        .layer(axum_mw::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&app_config.bind_addr).await.context("binding HTTP listener")?;
    info!(addr = %app_config.bind_addr, "HTTP surface listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    info!("shutting down: force-flushing ingest router and activity aggregator, unsubscribing book feed");
    ingest_router.shutdown();
    activity_aggregator.force_flush_all();
    book_service.shutdown();
    let _ = book_ws_handle;
    let _ = book_sweep_handle;

    Ok(())
}

fn log_activity_group(group: &ActivityGroup) {
    info!(
        group_key = %group.group_key,
        followed_user_id = %group.followed_user_id,
        activity_type = %group.activity_type,
        assets = group.asset_ids.len(),
        "persisted activity group as SKIP (merge/split/redeem not executable)"
    );
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "copytrail_backend=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
