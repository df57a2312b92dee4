//! Insight Miner — Binary Entrypoint
//! Boots the Axum HTTP server hosting the pipeline control surface and
//! wires the polling pipeline against its real dependencies.

use std::sync::Arc;

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use insight_miner::api::{create_router, AppState};
use insight_miner::config::PipelineConfig;
use insight_miner::infer::build_inference_client;
use insight_miner::metrics::Metrics;
use insight_miner::pipeline::Pipeline;
use insight_miner::publisher::{DynStoreWriter, HttpStoreWriter, MemoryStore};
use insight_miner::source::HttpContentSource;

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - INSIGHT_DEV_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("INSIGHT_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pipeline=info,throttle=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    enable_dev_tracing();

    let cfg = match PipelineConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed, using defaults");
            PipelineConfig::default()
        }
    };

    let metrics = Metrics::init(cfg.poll.interval_ms);

    let source = Arc::new(HttpContentSource::new(&cfg.content.base_url));
    let inference = build_inference_client(cfg.inference.model.as_deref());
    let store: DynStoreWriter = if cfg.store.enabled {
        Arc::new(HttpStoreWriter::new(&cfg.store.base_url))
    } else {
        tracing::info!("persistent store disabled, using in-memory store");
        Arc::new(MemoryStore::new())
    };

    let pipeline = Pipeline::new(&cfg, source, inference, store);
    if cfg.poll.autostart {
        pipeline.start();
    }

    let state = AppState { pipeline };
    let router = create_router(state).merge(metrics.router());

    Ok(router.into())
}
