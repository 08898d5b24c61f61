// src/ledger.rs
//! # Dedup Ledger
//! Remembers which article ids were already counted so each article feeds the
//! keyword totals at most once.
//!
//! Records expire after a retention horizon. An article still in a feed after
//! its record expired is counted again; that is the accepted cost of keeping the
//! ledger bounded.
//!
//! Persistence goes through [`LedgerBackend`]. A ledger that cannot be read or
//! parsed is treated as empty (everything gets re-processed once) instead of
//! failing the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::atomic::write_atomic;

/// One counted article. The article id is the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    #[serde(with = "crate::timefmt")]
    pub last_processed: DateTime<Utc>,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    pub source: String,
}

/// Raw storage for the serialized ledger document.
pub trait LedgerBackend: Send {
    /// `Ok(None)` when nothing was stored yet.
    fn load(&self) -> Result<Option<String>>;
    fn store(&self, contents: &str) -> Result<()>;
}

/// JSON object file: `{"<id>": {"last_processed": .., "keywords": [..], "source": ..}}`.
#[derive(Debug, Clone)]
pub struct FileLedgerBackend {
    path: PathBuf,
}

impl FileLedgerBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LedgerBackend for FileLedgerBackend {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading ledger {}", self.path.display())),
        }
    }

    fn store(&self, contents: &str) -> Result<()> {
        write_atomic(&self.path, contents.as_bytes())
    }
}

/// Shared in-memory document; clones see the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerBackend {
    doc: Arc<Mutex<Option<String>>>,
}

impl MemoryLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            doc: Arc::new(Mutex::new(Some(contents.into()))),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.doc.lock().expect("ledger doc mutex poisoned").clone()
    }
}

impl LedgerBackend for MemoryLedgerBackend {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.contents())
    }

    fn store(&self, contents: &str) -> Result<()> {
        *self.doc.lock().expect("ledger doc mutex poisoned") = Some(contents.to_string());
        Ok(())
    }
}

pub struct DedupLedger {
    records: BTreeMap<String, ArticleRecord>,
    backend: Box<dyn LedgerBackend>,
}

impl std::fmt::Debug for DedupLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupLedger")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl DedupLedger {
    /// Load the ledger from `backend`. Never fails; unreadable state starts empty.
    pub fn open(backend: Box<dyn LedgerBackend>) -> Self {
        let records = match backend.load() {
            Ok(Some(doc)) => parse_ledger(&doc),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(error = ?e, "ledger unreadable, starting empty");
                counter!("ledger_recovered_total").increment(1);
                BTreeMap::new()
            }
        };
        tracing::debug!(records = records.len(), "ledger loaded");
        Self { records, backend }
    }

    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryLedgerBackend::new()))
    }

    pub fn is_processed(&self, article_id: &str) -> bool {
        self.records.contains_key(article_id)
    }

    /// Insert or refresh the record for `article_id`.
    pub fn mark_processed<I, S>(
        &mut self,
        article_id: &str,
        timestamp: DateTime<Utc>,
        source: &str,
        keywords: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = ArticleRecord {
            last_processed: timestamp,
            keywords: keywords.into_iter().map(Into::into).collect(),
            source: source.to_string(),
        };
        self.records.insert(article_id.to_string(), record);
    }

    /// Drop every record with `last_processed < now - horizon`. Returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let cutoff = now - horizon;
        let before = self.records.len();
        self.records.retain(|_, r| r.last_processed >= cutoff);
        let removed = before - self.records.len();
        if removed > 0 {
            counter!("ledger_pruned_total").increment(removed as u64);
            tracing::debug!(removed, %cutoff, "ledger pruned");
        }
        removed
    }

    /// Persist current records through the backend.
    pub fn flush(&self) -> Result<()> {
        let doc = serde_json::to_string_pretty(&self.records).context("serializing ledger")?;
        self.backend.store(&doc)
    }

    pub fn get(&self, article_id: &str) -> Option<&ArticleRecord> {
        self.records.get(article_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Whole-document damage empties the ledger; a single bad record is skipped.
fn parse_ledger(doc: &str) -> BTreeMap<String, ArticleRecord> {
    let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(doc) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "ledger corrupt, starting empty");
            counter!("ledger_recovered_total").increment(1);
            return BTreeMap::new();
        }
    };

    let mut out = BTreeMap::new();
    for (id, value) in raw {
        match serde_json::from_value::<ArticleRecord>(value) {
            Ok(rec) => {
                out.insert(id, rec);
            }
            Err(e) => {
                tracing::warn!(error = %e, article_id = %id, "skipping malformed ledger record");
                counter!("ledger_skipped_records_total").increment(1);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn mark_then_lookup() {
        let mut l = DedupLedger::in_memory();
        assert!(!l.is_processed("https://a.test/1"));
        l.mark_processed("https://a.test/1", t(1), "SiteA", ["AI"]);
        assert!(l.is_processed("https://a.test/1"));
        assert_eq!(l.get("https://a.test/1").unwrap().source, "SiteA");
    }

    #[test]
    fn remarking_refreshes_timestamp() {
        let mut l = DedupLedger::in_memory();
        l.mark_processed("x", t(1), "SiteA", ["AI"]);
        l.mark_processed("x", t(5), "SiteA", ["AI"]);
        assert_eq!(l.len(), 1);
        assert_eq!(l.get("x").unwrap().last_processed, t(5));
    }

    #[test]
    fn prune_keeps_boundary_and_drops_older() {
        let mut l = DedupLedger::in_memory();
        l.mark_processed("old", t(0), "S", Vec::<String>::new());
        l.mark_processed("edge", t(2), "S", Vec::<String>::new());
        l.mark_processed("new", t(3), "S", Vec::<String>::new());
        let removed = l.prune(t(4), Duration::hours(2));
        assert_eq!(removed, 1);
        assert!(!l.is_processed("old"));
        assert!(l.is_processed("edge"));
        assert!(l.is_processed("new"));
    }

    #[test]
    fn flush_and_reopen_roundtrip() {
        let backend = MemoryLedgerBackend::new();
        let mut l = DedupLedger::open(Box::new(backend.clone()));
        l.mark_processed("x", t(1), "SiteA", ["AI", "Bitcoin"]);
        l.flush().unwrap();

        let reopened = DedupLedger::open(Box::new(backend));
        let rec = reopened.get("x").unwrap();
        assert_eq!(rec.keywords.len(), 2);
        assert_eq!(rec.last_processed, t(1));
    }

    #[test]
    fn corrupt_document_recovers_empty() {
        let backend = MemoryLedgerBackend::with_contents("{not json");
        let l = DedupLedger::open(Box::new(backend));
        assert!(l.is_empty());
    }

    #[test]
    fn malformed_record_is_skipped() {
        let doc = r#"{
            "good": {"last_processed": "2025-05-10T01:00:00+00:00", "keywords": ["AI"], "source": "SiteA"},
            "bad": {"keywords": ["AI"], "source": "SiteA"}
        }"#;
        let l = DedupLedger::open(Box::new(MemoryLedgerBackend::with_contents(doc)));
        assert!(l.is_processed("good"));
        assert!(!l.is_processed("bad"));
    }

    #[test]
    fn missing_file_starts_empty_and_flush_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("processed.json");
        let mut l = DedupLedger::open(Box::new(FileLedgerBackend::new(&path)));
        assert!(l.is_empty());
        l.mark_processed("x", t(1), "SiteA", ["AI"]);
        l.flush().unwrap();
        let doc = std::fs::read_to_string(&path).unwrap();
        assert!(doc.contains("\"last_processed\": \"2025-05-10T01:00:00Z\""));
    }
}
