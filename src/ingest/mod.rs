// src/ingest/mod.rs
pub mod providers;
pub mod types;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::extract::{tally, KeywordExtractor};
use crate::hourly_log::{HourlyCountLog, HourlyLogEntry};
use crate::ledger::DedupLedger;
use crate::metrics::ensure_metrics_described;
use crate::ingest::types::FeedProvider;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize text: decode entities, strip tags, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    out = RE_TAGS.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    out = RE_WS.replace_all(&out, " ").trim().to_string();

    // 5) Strip trailing sentence punctuation (keep quotes)
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    out
}

/// What one ingestion cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub fetched: usize,
    pub new_articles: usize,
    pub duplicates: usize,
    pub feed_errors: usize,
    pub ledger_pruned: usize,
    pub keywords_counted: u64,
    pub appended: bool,
    pub ledger_flushed: bool,
}

/// Run one ingestion cycle at `now`.
///
/// Order matters: the ledger is pruned first, the hourly entry is appended
/// before the ledger is flushed. If the append fails the ledger is not
/// persisted, so the same articles are counted on the next run instead of
/// being lost.
pub async fn run_cycle(
    providers: &[Box<dyn FeedProvider>],
    extractor: &dyn KeywordExtractor,
    ledger: &mut DedupLedger,
    log: &mut HourlyCountLog,
    ledger_horizon: Duration,
    now: DateTime<Utc>,
) -> Result<IngestReport> {
    ensure_metrics_described();

    let mut report = IngestReport {
        ledger_pruned: ledger.prune(now, ledger_horizon),
        ..Default::default()
    };
    let mut entry = HourlyLogEntry::new(now);

    for p in providers {
        let articles = match p.fetch_articles().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = ?e, feed = p.name(), "feed error, skipping");
                counter!("ingest_feed_errors_total").increment(1);
                report.feed_errors += 1;
                continue;
            }
        };
        report.fetched += articles.len();

        for article in articles {
            if article.id.trim().is_empty() {
                tracing::warn!(feed = p.name(), "article without id, skipping");
                continue;
            }
            if ledger.is_processed(&article.id) {
                report.duplicates += 1;
                continue;
            }

            let keywords = extractor.extract(&article.raw_text);
            let counts = tally(keywords);
            for (kw, n) in &counts {
                entry.add(&article.source, kw, *n);
                report.keywords_counted += n;
            }
            ledger.mark_processed(&article.id, now, &article.source, counts.into_keys());
            report.new_articles += 1;
        }
    }

    report.appended = log.append(&entry).context("appending hourly counts")?;

    match ledger.flush() {
        Ok(()) => report.ledger_flushed = true,
        Err(e) => {
            tracing::error!(error = ?e, "ledger flush failed; these articles may be counted again");
        }
    }

    counter!("ingest_articles_total").increment(report.fetched as u64);
    counter!("ingest_new_articles_total").increment(report.new_articles as u64);
    counter!("ingest_dedup_total").increment(report.duplicates as u64);
    gauge!("ingest_last_run_ts").set(now.timestamp() as f64);

    tracing::info!(
        target: "ingest",
        fetched = report.fetched,
        new = report.new_articles,
        duplicates = report.duplicates,
        feed_errors = report.feed_errors,
        pruned = report.ledger_pruned,
        keywords = report.keywords_counted,
        appended = report.appended,
        "ingest cycle finished"
    );

    Ok(report)
}
