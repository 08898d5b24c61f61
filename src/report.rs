// src/report.rs
//! Plain-text trend report, one block per window.
//!
//! Blocks are joined by [`SECTION_MARKER`] on its own line so a notifier can
//! send each window as a separate message.

use std::fmt::Write as _;

use crate::aggregate::{top_n, AggregationResult, WindowRollup, TOTAL_SOURCE};
use crate::hourly_log::KeywordCounts;

pub const SECTION_MARKER: &str = "---SPLIT---";
pub const NO_DATA: &str = "No trend data for this window.";

/// Render one window: header, the Total ranking, then each source by name.
/// A missing or empty window renders the [`NO_DATA`] placeholder.
pub fn format_window(window_name: &str, rollup: Option<&WindowRollup>, limit: usize) -> String {
    let mut out = format!("📊 Keyword trends ({window_name})\n");

    let Some(rollup) = rollup.filter(|r| !r.is_empty()) else {
        out.push_str(NO_DATA);
        out.push('\n');
        return out;
    };

    push_ranking(&mut out, TOTAL_SOURCE, rollup.total(), limit);
    for (source, counts) in rollup.sources() {
        out.push('\n');
        push_ranking(&mut out, source, counts, limit);
    }
    out
}

fn push_ranking(out: &mut String, title: &str, counts: &KeywordCounts, limit: usize) {
    let _ = writeln!(out, "[{title}]");
    let ranked = top_n(counts, limit);
    if ranked.is_empty() {
        out.push_str("(none)\n");
        return;
    }
    for (rank, (keyword, count)) in ranked.into_iter().enumerate() {
        let _ = writeln!(out, "{}. {keyword}: {count}", rank + 1);
    }
}

/// Render every window in `window_names` order, separated by the marker.
pub fn render<'a, I>(aggregation: &AggregationResult, window_names: I, limit: usize) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let blocks: Vec<String> = window_names
        .into_iter()
        .map(|name| format_window(name, aggregation.window(name), limit))
        .collect();
    blocks.join(&format!("{SECTION_MARKER}\n"))
}

/// Split a rendered report back into its window blocks.
pub fn split_blocks(report: &str) -> Vec<&str> {
    report
        .split(SECTION_MARKER)
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .collect()
}
