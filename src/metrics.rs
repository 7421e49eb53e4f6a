use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::models::Exchange;

/// Install the Prometheus exporter and register the copier's metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Pre-register per-venue counters so they appear before the first event.
    for exchange in Exchange::ALL {
        let ex = exchange.as_str();
        counter!("bus_events_published_total", "exchange" => ex).absolute(0);
        counter!("decode_errors_total", "exchange" => ex).absolute(0);
        counter!("replica_orders_placed_total", "exchange" => ex).absolute(0);
        counter!("replica_orders_failed_total", "exchange" => ex).absolute(0);
        counter!("ledger_write_failures_total", "exchange" => ex).absolute(0);
    }
    counter!("ledger_race_retries_total").absolute(0);

    gauge!("event_bus_backlog").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("replication_latency_seconds").record(0.0);

    Ok(handle)
}
