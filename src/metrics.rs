use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on the exporter).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Entries parsed from feeds.");
        describe_counter!("ingest_provider_errors_total", "Feed fetch/parse errors.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("ingest_last_run_ts", "Unix ts of the last ingest run.");

        describe_counter!("dedup_unique_total", "Articles registered as new content.");
        describe_counter!("dedup_duplicate_total", "Articles rejected as duplicates.");
        describe_counter!("dedup_purged_total", "Articles removed by the retention purge.");

        describe_histogram!("scoring_total_score", "Distribution of total relevance scores.");
        describe_counter!("pipeline_filtered_total", "Articles below the publish threshold.");
        describe_counter!("pipeline_rejected_total", "Articles rejected during shutdown.");

        describe_counter!("translate_cache_hits_total", "Translation cache hits.");
        describe_counter!("translate_cache_misses_total", "Translation cache misses.");
        describe_counter!("translate_backend_errors_total", "Failed backend translation calls.");

        describe_counter!("publish_published_total", "Successful publications.");
        describe_counter!("publish_retry_scheduled_total", "Publications scheduled for retry.");
        describe_counter!("publish_failed_total", "Publications moved to the dead-letter state.");

        describe_counter!("breaker_open_total", "Circuit breaker transitions to open.");
        describe_counter!("breaker_rejected_total", "Calls rejected by an open breaker.");
    });
}

/// Install the Prometheus recorder with its own scrape listener on `addr`.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
    ensure_described();
    Ok(())
}
