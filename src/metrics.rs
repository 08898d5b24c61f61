use std::path::Path;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up in the exposition).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_articles_total", "Articles returned by feeds.");
        describe_counter!(
            "ingest_new_articles_total",
            "Articles counted for the first time."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Articles skipped because the ledger already had them."
        );
        describe_counter!("ingest_feed_errors_total", "Feed fetch/parse errors.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("ingest_last_run_ts", "Unix ts when ingestion last ran.");

        describe_counter!("ledger_pruned_total", "Ledger records dropped by age.");
        describe_counter!(
            "ledger_recovered_total",
            "Times an unreadable ledger was replaced by an empty one."
        );
        describe_counter!(
            "ledger_skipped_records_total",
            "Malformed ledger records ignored on load."
        );

        describe_counter!("hourly_log_appended_total", "Hourly entries appended.");
        describe_counter!(
            "hourly_log_skipped_lines_total",
            "Malformed hourly log lines skipped while reading."
        );

        describe_counter!(
            "aggregate_entries_replayed_total",
            "Hourly entries replayed by the window aggregator."
        );
        describe_counter!("aggregate_runs_total", "Aggregation runs.");
        describe_counter!("trend_rows_written_total", "Rows written to the trend table.");
        describe_counter!(
            "trend_store_errors_total",
            "Aggregation runs whose results could not be saved."
        );
        describe_gauge!("aggregate_last_run_ts", "Unix ts when aggregation last ran.");

        describe_counter!("notify_messages_total", "Webhook messages delivered.");
        describe_counter!("notify_errors_total", "Webhook deliveries that gave up.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder for this process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Dump the exposition text to `path` (node_exporter textfile style).
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        crate::atomic::write_atomic(path, self.render().as_bytes())
            .with_context(|| format!("writing metrics to {}", path.display()))
    }
}
