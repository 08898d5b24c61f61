// src/hourly_log.rs
//! # Hourly Count Log
//! Append-only record of what was counted and when. One JSON object per line:
//!
//! ```text
//! {"timestamp":"2025-05-10T09:00:00Z","sources":{"SiteA":{"AI":3}}}
//! ```
//!
//! The aggregator replays this log; it is the only source of truth for trends.
//! Readers filter by timestamp and never rely on the lines being sorted.
//! Broken lines are skipped with a warning, never fatal.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::atomic::write_atomic;

pub type KeywordCounts = BTreeMap<String, u64>;
pub type SourceCounts = BTreeMap<String, KeywordCounts>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyLogEntry {
    #[serde(with = "crate::timefmt")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sources: SourceCounts,
}

impl HourlyLogEntry {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            sources: SourceCounts::new(),
        }
    }

    pub fn add(&mut self, source: &str, keyword: &str, count: u64) {
        let slot = self
            .sources
            .entry(source.to_string())
            .or_default()
            .entry(keyword.to_string())
            .or_insert(0);
        *slot = slot.saturating_add(count);
    }

    /// True when at least one keyword has a positive count.
    pub fn has_counts(&self) -> bool {
        self.sources.values().flat_map(|kw| kw.values()).any(|&c| c > 0)
    }

    /// Drop zero counts and sources left empty.
    pub fn compacted(mut self) -> Self {
        for kw in self.sources.values_mut() {
            kw.retain(|_, c| *c > 0);
        }
        self.sources.retain(|_, kw| !kw.is_empty());
        self
    }
}

pub type LineIter<'a> = Box<dyn Iterator<Item = io::Result<String>> + 'a>;

/// Raw line storage behind the log.
pub trait LogBackend: Send {
    fn append_line(&mut self, line: &str) -> Result<()>;
    /// Lines in stored order. A missing log yields no lines.
    fn lines(&self) -> Result<LineIter<'_>>;
    /// Replace the whole log. Must be atomic with respect to readers.
    fn replace(&mut self, lines: &[String]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileLogBackend {
    path: PathBuf,
}

impl FileLogBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogBackend for FileLogBackend {
    fn append_line(&mut self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(f, "{line}").with_context(|| format!("appending to {}", self.path.display()))?;
        f.sync_data()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(())
    }

    fn lines(&self) -> Result<LineIter<'_>> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()))
            }
            Err(e) => return Err(e).with_context(|| format!("opening {}", self.path.display())),
        };
        // Split on raw bytes so one badly encoded line doesn't poison the rest.
        let it = BufReader::new(f).split(b'\n').map(|chunk| {
            chunk.and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            })
        });
        Ok(Box::new(it))
    }

    fn replace(&mut self, lines: &[String]) -> Result<()> {
        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for l in lines {
            buf.push_str(l);
            buf.push('\n');
        }
        write_atomic(&self.path, buf.as_bytes())
    }
}

/// Shared in-memory lines; clones see the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogBackend {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Arc::new(Mutex::new(lines.into_iter().map(Into::into).collect())),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().expect("log mutex poisoned").clone()
    }
}

impl LogBackend for MemoryLogBackend {
    fn append_line(&mut self, line: &str) -> Result<()> {
        self.lines
            .lock()
            .expect("log mutex poisoned")
            .push(line.to_string());
        Ok(())
    }

    fn lines(&self) -> Result<LineIter<'_>> {
        Ok(Box::new(self.snapshot().into_iter().map(Ok)))
    }

    fn replace(&mut self, lines: &[String]) -> Result<()> {
        *self.lines.lock().expect("log mutex poisoned") = lines.to_vec();
        Ok(())
    }
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub kept: usize,
    pub removed: usize,
    pub malformed: usize,
}

pub struct HourlyCountLog {
    backend: Box<dyn LogBackend>,
}

impl std::fmt::Debug for HourlyCountLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HourlyCountLog").finish_non_exhaustive()
    }
}

impl HourlyCountLog {
    pub fn new(backend: Box<dyn LogBackend>) -> Self {
        Self { backend }
    }

    pub fn open_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(FileLogBackend::new(path)))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryLogBackend::new()))
    }

    /// Append one entry. Entries without a positive count are not written;
    /// returns whether a line was appended.
    pub fn append(&mut self, entry: &HourlyLogEntry) -> Result<bool> {
        let entry = entry.clone().compacted();
        if !entry.has_counts() {
            tracing::debug!("hourly entry has no counts, not appending");
            return Ok(false);
        }
        let line = serde_json::to_string(&entry).context("serializing hourly entry")?;
        self.backend.append_line(&line)?;
        counter!("hourly_log_appended_total").increment(1);
        Ok(true)
    }

    /// Lazily yield entries with `timestamp >= lower_bound`, in stored order.
    /// Each call starts from the beginning of the log.
    pub fn read_since(&self, lower_bound: DateTime<Utc>) -> Result<LogEntries<'_>> {
        Ok(LogEntries::new(self.backend.lines()?, Some(lower_bound)))
    }

    pub fn read_all(&self) -> Result<LogEntries<'_>> {
        Ok(LogEntries::new(self.backend.lines()?, None))
    }

    /// Keep only entries within `max_age` of the current time.
    pub fn prune(&mut self, max_age: Duration) -> Result<PruneStats> {
        self.prune_at(Utc::now(), max_age)
    }

    /// Rewrite the log keeping entries with `timestamp >= now - max_age`.
    /// Malformed lines are dropped by the rewrite.
    pub fn prune_at(&mut self, now: DateTime<Utc>, max_age: Duration) -> Result<PruneStats> {
        let cutoff = now - max_age;
        let mut stats = PruneStats::default();
        let mut kept = Vec::new();

        for (idx, line) in self.backend.lines()?.enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    stats.malformed += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("reading log line {}", idx + 1));
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Ok(entry) if entry.timestamp >= cutoff => {
                    kept.push(trimmed.to_string());
                    stats.kept += 1;
                }
                Ok(_) => stats.removed += 1,
                Err(_) => stats.malformed += 1,
            }
        }

        if stats.removed == 0 && stats.malformed == 0 {
            return Ok(stats);
        }
        self.backend.replace(&kept)?;
        tracing::info!(
            target: "hourly_log",
            kept = stats.kept,
            removed = stats.removed,
            malformed = stats.malformed,
            %cutoff,
            "hourly log pruned"
        );
        Ok(stats)
    }
}

fn parse_line(line: &str) -> Result<HourlyLogEntry, serde_json::Error> {
    serde_json::from_str(line)
}

/// Lazy reader over log lines. Skips blank and malformed lines and keeps count.
pub struct LogEntries<'a> {
    lines: LineIter<'a>,
    lower_bound: Option<DateTime<Utc>>,
    line_no: usize,
    skipped: usize,
    done: bool,
}

impl<'a> LogEntries<'a> {
    fn new(lines: LineIter<'a>, lower_bound: Option<DateTime<Utc>>) -> Self {
        Self {
            lines,
            lower_bound,
            line_no: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn skip(&mut self, reason: &dyn std::fmt::Display) {
        self.skipped += 1;
        counter!("hourly_log_skipped_lines_total").increment(1);
        tracing::warn!(line = self.line_no, reason = %reason, "skipping malformed hourly log line");
    }
}

impl Iterator for LogEntries<'_> {
    type Item = HourlyLogEntry;

    fn next(&mut self) -> Option<HourlyLogEntry> {
        while !self.done {
            let Some(line) = self.lines.next() else {
                self.done = true;
                break;
            };
            self.line_no += 1;

            let line = match line {
                Ok(l) => l,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.skip(&e);
                    continue;
                }
                Err(e) => {
                    // A real read failure would repeat forever; stop with what we have.
                    tracing::warn!(
                        error = %e,
                        line = self.line_no,
                        "hourly log read failed, stopping"
                    );
                    self.done = true;
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Ok(entry) => {
                    if self.lower_bound.is_some_and(|lb| entry.timestamp < lb) {
                        continue;
                    }
                    return Some(entry);
                }
                Err(e) => self.skip(&e),
            }
        }
        None
    }
}
