// src/trends.rs
//! One aggregation run: replay the hourly log into every window, persist the
//! rollup, render the report, then trim the log.
//!
//! A failing store does not stop the report; the error is handed back in
//! [`AggregationOutcome::persisted`] next to the rendered text.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};

use crate::aggregate::{aggregate, resolve_windows, AggregationResult};
use crate::config::{AppConfig, WindowConfig};
use crate::hourly_log::{HourlyCountLog, PruneStats};
use crate::metrics::ensure_metrics_described;
use crate::report;
use crate::trend_store::{SqliteTrendStore, StoreError, TrendStore};

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub windows: Vec<WindowConfig>,
    pub report_limit: usize,
    pub store_limit: Option<usize>,
    pub log_max_age: Duration,
}

impl AggregateOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            windows: cfg.windows.clone(),
            report_limit: cfg.report.limit,
            store_limit: cfg.report.store_limit,
            log_max_age: cfg.retention.log_max_age(),
        }
    }
}

#[derive(Debug)]
pub struct AggregationOutcome {
    /// Full, untruncated rollups.
    pub result: AggregationResult,
    pub report: String,
    /// Rows written, or why the store refused them (including failing to open).
    /// `Ok(0)` without touching the store when the log could not be read.
    pub persisted: Result<usize, StoreError>,
    pub skipped_lines: usize,
    /// Set when the hourly log could not be opened; every window then renders
    /// the no-data placeholder.
    pub log_error: Option<anyhow::Error>,
    /// `None` when trimming the log failed or was skipped (already logged).
    pub pruned: Option<PruneStats>,
}

impl AggregationOutcome {
    /// Both the log read and the save went through.
    pub fn is_complete(&self) -> bool {
        self.log_error.is_none() && self.persisted.is_ok()
    }
}

/// Aggregate, save and render. Never fails: log and store problems are
/// recorded in the outcome and the report is always produced.
pub fn run_aggregation(
    log: &mut HourlyCountLog,
    store: Result<&mut dyn TrendStore, StoreError>,
    opts: &AggregateOptions,
    now: DateTime<Utc>,
) -> AggregationOutcome {
    ensure_metrics_described();

    let windows = resolve_windows(&opts.windows, now);
    let widest = windows
        .iter()
        .map(|w| w.lower_bound)
        .min()
        .unwrap_or(now);

    let (result, skipped_lines, log_error) = match log.read_since(widest) {
        Ok(mut entries) => {
            let result = aggregate(entries.by_ref(), &windows);
            let skipped = entries.skipped();
            (result, skipped, None)
        }
        Err(e) => {
            tracing::warn!(error = ?e, "hourly log unreadable; reporting without data");
            (aggregate(std::iter::empty(), &windows), 0, Some(e))
        }
    };

    let persisted = if log_error.is_some() {
        // keep whatever today's rows already hold
        Ok(0)
    } else {
        let to_store = match opts.store_limit {
            Some(limit) => result.truncated(limit),
            None => result.clone(),
        };
        store.and_then(|s| s.save(&to_store, now))
    };
    if let Err(e) = &persisted {
        counter!("trend_store_errors_total").increment(1);
        tracing::error!(error = %e, "saving trends failed; report is still produced");
    }

    let report = report::render(
        &result,
        opts.windows.iter().map(|w| w.name.as_str()),
        opts.report_limit,
    );

    let pruned = if log_error.is_some() {
        None
    } else {
        match log.prune_at(now, opts.log_max_age) {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = ?e, "hourly log prune failed");
                None
            }
        }
    };

    counter!("aggregate_runs_total").increment(1);
    gauge!("aggregate_last_run_ts").set(now.timestamp() as f64);
    tracing::info!(
        target: "aggregate",
        windows = result.len(),
        skipped_lines,
        log_ok = log_error.is_none(),
        stored = persisted.as_ref().ok().copied(),
        "aggregation finished"
    );

    AggregationOutcome {
        result,
        report,
        persisted,
        skipped_lines,
        log_error,
        pruned,
    }
}

/// [`run_aggregation`] against the SQLite table at `database`. A database
/// that cannot be opened is reported through `persisted`.
pub fn run_with_sqlite(
    log: &mut HourlyCountLog,
    database: &Path,
    opts: &AggregateOptions,
    now: DateTime<Utc>,
) -> AggregationOutcome {
    let mut sqlite;
    let store: Result<&mut dyn TrendStore, StoreError> = match SqliteTrendStore::open(database) {
        Ok(s) => {
            sqlite = s;
            Ok(&mut sqlite)
        }
        Err(e) => {
            tracing::error!(error = %e, path = %database.display(), "trend database unavailable");
            Err(e)
        }
    };
    run_aggregation(log, store, opts, now)
}
