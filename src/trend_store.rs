// src/trend_store.rs
//! # Trend Store
//! Persisted daily rollups, one row per `(window, source, keyword, day)`.
//!
//! `save` replaces the whole day inside one transaction: delete every row dated
//! `as_of`, then insert the new rollup. Keywords that fell out since the last
//! run therefore disappear from today's rows instead of going stale, and
//! repeated runs on the same day never accumulate.

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;

use crate::aggregate::AggregationResult;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("count {count} for keyword {keyword:?} does not fit the store")]
    CountOutOfRange { keyword: String, count: u64 },
    #[error("malformed stored date {0:?}")]
    BadDate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrendRow {
    pub window_type: String,
    pub source_name: String,
    pub keyword: String,
    pub count: u64,
    pub date: NaiveDate,
}

pub trait TrendStore {
    /// Replace every row dated `as_of.date_naive()` with `aggregation`.
    /// Returns the number of rows written. On error nothing changes.
    fn save(&mut self, aggregation: &AggregationResult, as_of: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Most recent day's `(keyword, count)` for the pair, count descending,
    /// keyword ascending on ties, at most `limit` rows.
    fn latest(&self, window: &str, source: &str, limit: usize)
        -> Result<Vec<(String, u64)>, StoreError>;

    /// All rows of one day, sorted.
    fn rows_on(&self, date: NaiveDate) -> Result<Vec<TrendRow>, StoreError>;
}

const DATE_FMT: &str = "%Y-%m-%d";

/// SQLite-backed `daily_trends` table.
pub struct SqliteTrendStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteTrendStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTrendStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteTrendStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_db()?;
        tracing::debug!(path = %path.display(), "trend store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_trends (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trend_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                keyword TEXT NOT NULL,
                count INTEGER NOT NULL,
                date TEXT NOT NULL,
                UNIQUE(trend_type, source_name, keyword, date)
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_daily_trends_lookup
             ON daily_trends(trend_type, source_name, date)",
            [],
        )?;
        Ok(())
    }
}

impl TrendStore for SqliteTrendStore {
    fn save(
        &mut self,
        aggregation: &AggregationResult,
        as_of: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let day = as_of.date_naive().format(DATE_FMT).to_string();
        let tx = self.conn.transaction()?;

        let deleted = tx.execute("DELETE FROM daily_trends WHERE date = ?1", params![day])?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO daily_trends (trend_type, source_name, keyword, count, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (window, source, keyword, count) in aggregation.rows() {
                let count_i64 = i64::try_from(count).map_err(|_| StoreError::CountOutOfRange {
                    keyword: keyword.to_string(),
                    count,
                })?;
                stmt.execute(params![window, source, keyword, count_i64, day])?;
                written += 1;
            }
        }
        tx.commit()?;

        counter!("trend_rows_written_total").increment(written as u64);
        tracing::info!(
            target: "trend_store",
            %day,
            deleted,
            written,
            "daily trends replaced"
        );
        Ok(written)
    }

    fn latest(
        &self,
        window: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let latest_day: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(date) FROM daily_trends WHERE trend_type = ?1 AND source_name = ?2",
                params![window, source],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(day) = latest_day else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            "SELECT keyword, count FROM daily_trends
             WHERE trend_type = ?1 AND source_name = ?2 AND date = ?3
             ORDER BY count DESC, keyword ASC
             LIMIT ?4",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![window, source, day, limit], |row| {
                let keyword: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((keyword, u64::try_from(count).unwrap_or(0)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn rows_on(&self, date: NaiveDate) -> Result<Vec<TrendRow>, StoreError> {
        let day = date.format(DATE_FMT).to_string();
        let mut stmt = self.conn.prepare(
            "SELECT trend_type, source_name, keyword, count, date FROM daily_trends
             WHERE date = ?1",
        )?;
        let raw = stmt
            .query_map(params![day], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = raw
            .into_iter()
            .map(|(window_type, source_name, keyword, count, date)| {
                let date = NaiveDate::parse_from_str(&date, DATE_FMT)
                    .map_err(|_| StoreError::BadDate(date.clone()))?;
                Ok(TrendRow {
                    window_type,
                    source_name,
                    keyword,
                    count: u64::try_from(count).unwrap_or(0),
                    date,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        rows.sort();
        Ok(rows)
    }
}

type RowKey = (NaiveDate, String, String, String);

/// Same semantics as the SQLite table, kept in a map. Used in tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrendStore {
    rows: BTreeMap<RowKey, u64>,
}

impl MemoryTrendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl TrendStore for MemoryTrendStore {
    fn save(
        &mut self,
        aggregation: &AggregationResult,
        as_of: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let day = as_of.date_naive();
        let mut fresh = Vec::new();
        for (window, source, keyword, count) in aggregation.rows() {
            if i64::try_from(count).is_err() {
                return Err(StoreError::CountOutOfRange {
                    keyword: keyword.to_string(),
                    count,
                });
            }
            fresh.push((
                (day, window.to_string(), source.to_string(), keyword.to_string()),
                count,
            ));
        }

        self.rows.retain(|(d, ..), _| *d != day);
        let written = fresh.len();
        self.rows.extend(fresh);
        Ok(written)
    }

    fn latest(
        &self,
        window: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let matches = |(_, w, s, _): &RowKey| w == window && s == source;
        let Some(day) = self.rows.keys().filter(|k| matches(*k)).map(|k| k.0).max() else {
            return Ok(Vec::new());
        };
        let mut out: Vec<(String, u64)> = self
            .rows
            .iter()
            .filter(|(k, _)| k.0 == day && matches(*k))
            .map(|(k, &c)| (k.3.clone(), c))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.truncate(limit);
        Ok(out)
    }

    fn rows_on(&self, date: NaiveDate) -> Result<Vec<TrendRow>, StoreError> {
        let mut rows: Vec<TrendRow> = self
            .rows
            .iter()
            .filter(|(k, _)| k.0 == date)
            .map(|((d, w, s, k), &c)| TrendRow {
                window_type: w.clone(),
                source_name: s.clone(),
                keyword: k.clone(),
                count: c,
                date: *d,
            })
            .collect();
        rows.sort();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, WindowDefinition};
    use crate::hourly_log::HourlyLogEntry;
    use chrono::{Duration, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap()
    }

    fn sample(rows: &[(&str, &str, u64)]) -> AggregationResult {
        let mut e = HourlyLogEntry::new(as_of());
        for (s, k, c) in rows {
            e.add(s, k, *c);
        }
        aggregate(
            vec![e],
            &[WindowDefinition::new("24h", as_of() - Duration::hours(24))],
        )
    }

    fn stores() -> Vec<Box<dyn TrendStore>> {
        vec![
            Box::new(SqliteTrendStore::open_in_memory().unwrap()),
            Box::new(MemoryTrendStore::new()),
        ]
    }

    #[test]
    fn save_twice_same_day_is_idempotent() {
        for mut store in stores() {
            let agg = sample(&[("SiteA", "AI", 3), ("SiteB", "DeFi", 1)]);
            assert_eq!(store.save(&agg, as_of()).unwrap(), 4);
            let first = store.rows_on(as_of().date_naive()).unwrap();
            store.save(&agg, as_of() + Duration::hours(3)).unwrap();
            let second = store.rows_on(as_of().date_naive()).unwrap();
            assert_eq!(first, second);
            assert_eq!(second.len(), 4);
        }
    }

    #[test]
    fn resave_drops_keywords_that_fell_out() {
        for mut store in stores() {
            store
                .save(&sample(&[("SiteA", "AI", 3), ("SiteA", "NFT", 1)]), as_of())
                .unwrap();
            store.save(&sample(&[("SiteA", "AI", 4)]), as_of()).unwrap();
            let rows = store.rows_on(as_of().date_naive()).unwrap();
            assert!(rows.iter().all(|r| r.keyword == "AI"));
            assert_eq!(store.latest("24h", "Total", 10).unwrap(), vec![("AI".to_string(), 4)]);
        }
    }

    #[test]
    fn previous_days_are_kept_and_latest_reads_newest() {
        for mut store in stores() {
            let yesterday = as_of() - Duration::days(1);
            store.save(&sample(&[("SiteA", "Old", 9)]), yesterday).unwrap();
            store
                .save(&sample(&[("SiteA", "b", 2), ("SiteA", "a", 2), ("SiteA", "c", 5)]), as_of())
                .unwrap();

            assert_eq!(store.rows_on(yesterday.date_naive()).unwrap().len(), 2);
            let latest = store.latest("24h", "SiteA", 2).unwrap();
            assert_eq!(latest, vec![("c".to_string(), 5), ("a".to_string(), 2)]);
        }
    }

    #[test]
    fn latest_of_unknown_pair_is_empty() {
        for store in stores() {
            assert!(store.latest("24h", "Nobody", 5).unwrap().is_empty());
        }
    }

    #[test]
    fn out_of_range_count_aborts_without_partial_day() {
        for mut store in stores() {
            store.save(&sample(&[("SiteA", "AI", 3)]), as_of()).unwrap();
            let huge = sample(&[("SiteA", "AI", 1), ("SiteA", "Huge", u64::MAX)]);
            let err = store.save(&huge, as_of()).unwrap_err();
            assert!(matches!(err, StoreError::CountOutOfRange { .. }));
            let rows = store.rows_on(as_of().date_naive()).unwrap();
            assert_eq!(rows.len(), 2);
            assert!(rows.iter().all(|r| r.count == 3));
        }
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("trends.db");
        {
            let mut store = SqliteTrendStore::open(&path).unwrap();
            store.save(&sample(&[("SiteA", "AI", 3)]), as_of()).unwrap();
        }
        let store = SqliteTrendStore::open(&path).unwrap();
        assert_eq!(store.latest("24h", "SiteA", 5).unwrap(), vec![("AI".to_string(), 3)]);
    }
}
