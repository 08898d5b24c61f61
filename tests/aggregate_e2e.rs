// tests/aggregate_e2e.rs
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::io::Write;

use keyword_trends::config::WindowConfig;
use keyword_trends::hourly_log::{HourlyCountLog, HourlyLogEntry, LineIter, LogBackend};
use keyword_trends::report::{split_blocks, NO_DATA};
use keyword_trends::trend_store::{SqliteTrendStore, StoreError, TrendRow, TrendStore};
use keyword_trends::trends::{run_aggregation, run_with_sqlite, AggregateOptions};
use keyword_trends::AggregationResult;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap()
}

fn opts() -> AggregateOptions {
    AggregateOptions {
        windows: vec![
            WindowConfig::new("24h", 24),
            WindowConfig::new("1month", 720),
            WindowConfig::new("3month", 2160),
        ],
        report_limit: 10,
        store_limit: None,
        log_max_age: Duration::days(95),
    }
}

fn entry(ago: Duration, rows: &[(&str, &str, u64)]) -> HourlyLogEntry {
    let mut e = HourlyLogEntry::new(now() - ago);
    for (source, kw, n) in rows {
        e.add(source, kw, *n);
    }
    e
}

#[test]
fn two_entries_roll_up_into_total_and_sources() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = HourlyCountLog::open_file(dir.path().join("hourly.jsonl"));
    log.append(&entry(Duration::hours(1), &[("SiteA", "AI", 3)])).unwrap();
    log.append(&entry(
        Duration::minutes(30),
        &[("SiteA", "AI", 2), ("SiteB", "AI", 1)],
    ))
    .unwrap();
    let mut store = SqliteTrendStore::open(dir.path().join("trends.sqlite")).unwrap();

    let out = run_aggregation(&mut log, Ok(&mut store), &opts(), now());

    let day = out.result.window("24h").unwrap();
    assert_eq!(day.total()["AI"], 6);
    assert_eq!(day.source("SiteA").unwrap()["AI"], 5);
    assert_eq!(day.source("SiteB").unwrap()["AI"], 1);

    assert_eq!(out.persisted.unwrap(), 9);
    assert_eq!(
        store.latest("24h", "Total", 5).unwrap(),
        vec![("AI".to_string(), 6)]
    );
    let rows = store.rows_on(now().date_naive()).unwrap();
    assert!(rows.contains(&TrendRow {
        window_type: "3month".into(),
        source_name: "SiteB".into(),
        keyword: "AI".into(),
        count: 1,
        date: now().date_naive(),
    }));

    let blocks = split_blocks(&out.report);
    assert_eq!(blocks.len(), 3);
    assert!(blocks[0].contains("[Total]\n1. AI: 6"));
}

#[test]
fn wider_windows_never_count_less() {
    let mut log = HourlyCountLog::in_memory();
    for (ago, n) in [(2, 1), (24 * 10, 4), (24 * 60, 9), (24 * 200, 100)] {
        log.append(&entry(Duration::hours(ago), &[("SiteA", "AI", n)]))
            .unwrap();
    }
    let mut store = SqliteTrendStore::open_in_memory().unwrap();

    let out = run_aggregation(&mut log, Ok(&mut store), &opts(), now());
    let ai = |w: &str| out.result.window(w).unwrap().total()["AI"];

    assert_eq!(ai("24h"), 1);
    assert_eq!(ai("1month"), 5);
    assert_eq!(ai("3month"), 14);
    assert!(ai("3month") >= ai("1month") && ai("1month") >= ai("24h"));
}

#[test]
fn rerun_same_day_replaces_rows() {
    let mut log = HourlyCountLog::in_memory();
    log.append(&entry(Duration::hours(1), &[("SiteA", "AI", 3), ("SiteA", "NFT", 1)]))
        .unwrap();
    let mut store = SqliteTrendStore::open_in_memory().unwrap();

    let first = run_aggregation(&mut log, Ok(&mut store), &opts(), now());
    let before = store.rows_on(now().date_naive()).unwrap();

    let second = run_aggregation(&mut log, Ok(&mut store), &opts(), now() + Duration::hours(2));
    let after = store.rows_on(now().date_naive()).unwrap();

    assert_eq!(first.persisted.unwrap(), second.persisted.unwrap());
    assert_eq!(before, after);
}

#[test]
fn empty_log_reports_placeholder_for_every_window() {
    let mut log = HourlyCountLog::in_memory();
    let mut store = SqliteTrendStore::open_in_memory().unwrap();

    let out = run_aggregation(&mut log, Ok(&mut store), &opts(), now());

    assert_eq!(out.persisted.unwrap(), 0);
    let blocks = split_blocks(&out.report);
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|b| b.contains(NO_DATA)));
}

#[test]
fn garbage_lines_do_not_stop_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hourly.jsonl");
    let good = serde_json::to_string(&entry(Duration::hours(3), &[("SiteA", "AI", 2)])).unwrap();
    {
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{good}").unwrap();
        writeln!(f, "{{\"timestamp\": \"not a date\"}}").unwrap();
        f.write_all(b"\xff\xfe broken bytes\n").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{{truncated").unwrap();
        writeln!(f, "{good}").unwrap();
    }
    let mut log = HourlyCountLog::open_file(&path);
    let mut store = SqliteTrendStore::open_in_memory().unwrap();

    let out = run_aggregation(&mut log, Ok(&mut store), &opts(), now());

    assert_eq!(out.skipped_lines, 3);
    assert_eq!(out.result.window("24h").unwrap().total()["AI"], 4);
    // the retention rewrite drops the malformed lines
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
}

struct ReadOnlyStore;

impl TrendStore for ReadOnlyStore {
    fn save(&mut self, _: &AggregationResult, _: DateTime<Utc>) -> Result<usize, StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        )))
    }
    fn latest(&self, _: &str, _: &str, _: usize) -> Result<Vec<(String, u64)>, StoreError> {
        Ok(Vec::new())
    }
    fn rows_on(&self, _: chrono::NaiveDate) -> Result<Vec<TrendRow>, StoreError> {
        Ok(Vec::new())
    }
}

#[test]
fn store_failure_still_produces_report() {
    let mut log = HourlyCountLog::in_memory();
    log.append(&entry(Duration::hours(1), &[("SiteA", "AI", 3)])).unwrap();

    let out = run_aggregation(&mut log, Ok(&mut ReadOnlyStore), &opts(), now());

    assert!(matches!(out.persisted, Err(StoreError::Io(_))));
    assert!(out.report.contains("1. AI: 3"));
}

#[test]
fn unreadable_database_file_still_produces_report() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("trends.db");
    std::fs::write(&db, "not a database ".repeat(300)).unwrap();
    let mut log = HourlyCountLog::in_memory();
    log.append(&entry(Duration::minutes(5), &[("SiteA", "AI", 2)])).unwrap();

    let out = run_with_sqlite(&mut log, &db, &opts(), now());

    assert!(matches!(out.persisted, Err(StoreError::Database(_))));
    assert!(!out.is_complete());
    assert_eq!(split_blocks(&out.report).len(), 3);
    assert!(out.report.contains("1. AI: 2"));
}

#[test]
fn sqlite_wrapper_saves_when_database_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("trends.db");
    let mut log = HourlyCountLog::in_memory();
    log.append(&entry(Duration::minutes(5), &[("SiteA", "AI", 2)])).unwrap();

    let out = run_with_sqlite(&mut log, &db, &opts(), now());

    assert!(out.is_complete());
    assert_eq!(out.persisted.unwrap(), 6);
    let store = SqliteTrendStore::open(&db).unwrap();
    assert_eq!(store.latest("24h", "SiteA", 1).unwrap(), vec![("AI".to_string(), 2)]);
}

struct UnreadableLog;

impl LogBackend for UnreadableLog {
    fn append_line(&mut self, _line: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn lines(&self) -> anyhow::Result<LineIter<'_>> {
        Err(anyhow::anyhow!("permission denied"))
    }
    fn replace(&mut self, _lines: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn unreadable_log_reports_placeholders_and_keeps_stored_rows() {
    let mut store = SqliteTrendStore::open_in_memory().unwrap();
    let mut good = HourlyCountLog::in_memory();
    good.append(&entry(Duration::hours(1), &[("SiteA", "AI", 3)])).unwrap();
    run_aggregation(&mut good, Ok(&mut store), &opts(), now());

    let mut log = HourlyCountLog::new(Box::new(UnreadableLog));
    let out = run_aggregation(&mut log, Ok(&mut store), &opts(), now() + Duration::hours(1));

    assert!(out.log_error.is_some());
    assert!(out.pruned.is_none());
    let blocks = split_blocks(&out.report);
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|b| b.contains(NO_DATA)));
    // today's rows from the earlier run are left alone
    assert_eq!(store.latest("24h", "Total", 5).unwrap(), vec![("AI".to_string(), 3)]);
}
