//! Gateway entry point. Wires the composition root (spec.md §9) and
//! starts the HTTP listener, following the teacher's binary shape:
//! parse config, install tracing + metrics, build the shared state once,
//! spawn background workers, serve.

mod bot;
mod config;
mod error;
mod http;
mod ids;
mod key_directory;
mod limiter;
mod metrics;
mod model;
mod proxy;
mod store;
mod transparency;
mod watermark;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::bot::BotClassifier;
use crate::config::AppConfig;
use crate::http::AppState;
use crate::key_directory::KeyDirectory;
use crate::limiter::Limiter;
use crate::metrics as gateway_metrics;
use crate::proxy::ProxyEngine;
use crate::store::{MemStore, PgStore, Store};
use crate::transparency::{anchor, TransparencyLog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::parse();
    let metrics_handle = gateway_metrics::install();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!(region = %config.region, "connecting to postgres store");
            let pg = PgStore::connect(url).await?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; running with an in-process store (dev mode)");
            Arc::new(MemStore::new())
        }
    };

    let (anchor_handle, _anchor_worker) = anchor::spawn(&config, store.clone());

    let key_directory = Arc::new(KeyDirectory::new(store.clone()));
    let limiter = Arc::new(Limiter::new(&config));
    let bot_classifier = Arc::new(BotClassifier::new(store.clone()));
    let transparency = Arc::new(TransparencyLog::new(store.clone(), anchor_handle, &config));
    let proxy_engine = Arc::new(ProxyEngine::new(
        store.clone(),
        key_directory.clone(),
        limiter.clone(),
        bot_classifier.clone(),
        transparency.clone(),
    ));

    // Bounds bucket-map growth for keys that have gone quiet
    // (spec.md §4.2, §5 Shared resources).
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                limiter.evict_idle();
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        key_directory,
        limiter,
        bot_classifier,
        transparency,
        proxy_engine,
    });

    let app = http::router(state, metrics_handle);

    tracing::info!(addr = %config.bind_addr, region = %config.region, "gateway listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
