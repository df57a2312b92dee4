use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time registration of every series the pipeline emits, so they show
/// up on /metrics with help text even before first increment.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_cycles_total", "Completed poll cycles.");
        describe_counter!("items_kept_total", "Items that passed deduplication.");
        describe_counter!("dedup_dropped_total", "Items dropped as already seen.");
        describe_counter!("source_errors_total", "Content source fetch failures.");
        describe_counter!(
            "partition_skips_total",
            "Partitions skipped this cycle because the gate rejected the call."
        );
        describe_counter!("insights_generated_total", "Insights produced.");
        describe_counter!(
            "generation_failures_total",
            "Inference failures, item dropped."
        );
        describe_counter!(
            "generation_throttled_total",
            "Generations rejected by the gate."
        );
        describe_counter!("published_total", "Records published to the snapshot.");
        describe_counter!("store_write_errors_total", "Persistent store write failures.");
        describe_counter!("throttle_rejected_total", "Calls rejected by an open breaker.");
        describe_counter!("throttle_breaker_opened_total", "Breaker open transitions.");
        describe_gauge!("throttle_backoff_ms", "Current backoff per dependency.");
        describe_gauge!("throttle_breaker_open", "1 when the breaker is open.");
        describe_gauge!("dedup_set_size", "Ids recorded by the deduplicator.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize Prometheus recorder and expose a static gauge with the
    /// configured poll interval.
    pub fn init(poll_interval_ms: u64) -> Self {
        // Use default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        ensure_metrics_described();
        gauge!("configured_poll_interval_ms").set(poll_interval_ms as f64);

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
