// src/aggregate.rs
//! # Window Aggregator
//! Replays hourly log entries into per-window rollups.
//!
//! Every window is anchored by a lower bound (`now - span`) and open-ended
//! towards the present. The log is scanned once; each entry is tested against
//! every window's bound and its counts are added to the per-source bucket and
//! to the derived `"Total"` bucket of each window it falls in.
//!
//! A window that was aggregated but saw no entries still has a `"Total"` bucket
//! (empty). A window that was never aggregated is simply absent from the
//! [`AggregationResult`].

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::BTreeMap;

use crate::config::WindowConfig;
use crate::hourly_log::{HourlyLogEntry, KeywordCounts};

/// Name of the bucket that sums all sources of a window.
pub const TOTAL_SOURCE: &str = "Total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDefinition {
    pub name: String,
    pub lower_bound: DateTime<Utc>,
}

impl WindowDefinition {
    pub fn new(name: impl Into<String>, lower_bound: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            lower_bound,
        }
    }

    /// Window covering `[now - span, ..)`.
    pub fn trailing(name: impl Into<String>, now: DateTime<Utc>, span: Duration) -> Self {
        Self::new(name, now - span)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.lower_bound
    }
}

/// Turn configured spans into concrete windows anchored at `now`. Order is kept.
pub fn resolve_windows(configs: &[WindowConfig], now: DateTime<Utc>) -> Vec<WindowDefinition> {
    configs
        .iter()
        .map(|c| WindowDefinition::trailing(c.name.clone(), now, c.span()))
        .collect()
}

/// One window's counts: `source-or-"Total" -> keyword -> count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRollup {
    buckets: BTreeMap<String, KeywordCounts>,
}

impl Default for WindowRollup {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowRollup {
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(TOTAL_SOURCE.to_string(), KeywordCounts::new());
        Self { buckets }
    }

    pub fn total(&self) -> &KeywordCounts {
        // `new` always seeds the Total bucket and nothing removes it.
        static EMPTY: KeywordCounts = KeywordCounts::new();
        self.buckets.get(TOTAL_SOURCE).unwrap_or(&EMPTY)
    }

    pub fn source(&self, name: &str) -> Option<&KeywordCounts> {
        self.buckets.get(name)
    }

    /// Per-source buckets sorted by source name, without `"Total"`.
    pub fn sources(&self) -> impl Iterator<Item = (&str, &KeywordCounts)> {
        self.buckets
            .iter()
            .filter(|(name, _)| name.as_str() != TOTAL_SOURCE)
            .map(|(name, counts)| (name.as_str(), counts))
    }

    /// Every bucket including `"Total"`.
    pub fn buckets(&self) -> impl Iterator<Item = (&str, &KeywordCounts)> {
        self.buckets.iter().map(|(name, counts)| (name.as_str(), counts))
    }

    /// No keyword was counted in this window.
    pub fn is_empty(&self) -> bool {
        self.total().is_empty()
    }

    fn add(&mut self, source: &str, keyword: &str, count: u64) {
        for bucket in [source, TOTAL_SOURCE] {
            let slot = self
                .buckets
                .entry(bucket.to_string())
                .or_default()
                .entry(keyword.to_string())
                .or_insert(0);
            bump(slot, count, keyword);
        }
    }

    /// Keep only each bucket's top `limit` keywords.
    pub fn truncated(&self, limit: usize) -> Self {
        let buckets = self
            .buckets
            .iter()
            .map(|(name, counts)| {
                let kept = top_n(counts, limit)
                    .into_iter()
                    .map(|(kw, c)| (kw.to_string(), c))
                    .collect();
                (name.clone(), kept)
            })
            .collect();
        Self { buckets }
    }
}

fn bump(slot: &mut u64, count: u64, keyword: &str) {
    match slot.checked_add(count) {
        Some(v) => *slot = v,
        None => {
            tracing::error!(keyword, "keyword count overflowed u64, saturating");
            *slot = u64::MAX;
        }
    }
}

/// `window-name -> rollup`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationResult {
    windows: BTreeMap<String, WindowRollup>,
}

impl AggregationResult {
    pub fn window(&self, name: &str) -> Option<&WindowRollup> {
        self.windows.get(name)
    }

    pub fn windows(&self) -> impl Iterator<Item = (&str, &WindowRollup)> {
        self.windows.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, rollup: WindowRollup) {
        self.windows.insert(name.into(), rollup);
    }

    /// Copy keeping only each bucket's top `limit` keywords.
    pub fn truncated(&self, limit: usize) -> Self {
        Self {
            windows: self
                .windows
                .iter()
                .map(|(n, r)| (n.clone(), r.truncated(limit)))
                .collect(),
        }
    }

    /// Flattened `(window, source_or_total, keyword, count)` tuples.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &str, &str, u64)> {
        self.windows.iter().flat_map(|(window, rollup)| {
            rollup.buckets().flat_map(move |(source, counts)| {
                counts
                    .iter()
                    .map(move |(kw, &c)| (window.as_str(), source, kw.as_str(), c))
            })
        })
    }
}

/// Fold `entries` into every window in one pass.
///
/// Zero counts are ignored, as is a source literally called `"Total"` inside an
/// entry; the total is always derived here.
pub fn aggregate<I>(entries: I, windows: &[WindowDefinition]) -> AggregationResult
where
    I: IntoIterator<Item = HourlyLogEntry>,
{
    let mut rollups: Vec<WindowRollup> = windows.iter().map(|_| WindowRollup::new()).collect();
    let mut replayed = 0u64;
    let mut matching: Vec<usize> = Vec::with_capacity(windows.len());

    for entry in entries {
        replayed += 1;
        matching.clear();
        matching.extend(
            windows
                .iter()
                .enumerate()
                .filter(|(_, w)| w.contains(entry.timestamp))
                .map(|(i, _)| i),
        );
        if matching.is_empty() {
            continue;
        }

        for (source, counts) in &entry.sources {
            if source == TOTAL_SOURCE {
                continue;
            }
            for (keyword, &count) in counts {
                if count == 0 {
                    continue;
                }
                for &i in &matching {
                    rollups[i].add(source, keyword, count);
                }
            }
        }
    }

    counter!("aggregate_entries_replayed_total").increment(replayed);

    let mut result = AggregationResult::default();
    for (w, rollup) in windows.iter().zip(rollups) {
        result.insert(w.name.clone(), rollup);
    }
    result
}

/// Rank by count descending, ties by keyword ascending, keep `limit`.
pub fn top_n(counts: &KeywordCounts, limit: usize) -> Vec<(&str, u64)> {
    let mut ranked: Vec<(&str, u64)> = counts.iter().map(|(k, &c)| (k.as_str(), c)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(limit);
    ranked
}
