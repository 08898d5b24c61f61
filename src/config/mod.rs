// src/config/mod.rs
//! Application configuration loaded from TOML.
//!
//! Lookup order:
//! 1) `$TRENDS_CONFIG_PATH`
//! 2) `config/trends.toml`
//!
//! A missing or invalid file is a startup error; nothing here falls back to
//! built-in defaults for the file itself, only for individual fields.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregate::TOTAL_SOURCE;

pub const DEFAULT_CONFIG_PATH: &str = "config/trends.toml";
pub const ENV_CONFIG_PATH: &str = "TRENDS_CONFIG_PATH";
pub const ENV_DISCORD_WEBHOOK: &str = "DISCORD_WEBHOOK_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,
    #[serde(default)]
    pub keywords: KeywordsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            log_path: default_log_path(),
            database_path: default_database_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/processed_articles.json")
}
fn default_log_path() -> PathBuf {
    PathBuf::from("data/hourly_counts.jsonl")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("data/keyword_trends.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// How long an article id stays in the dedup ledger.
    #[serde(default = "default_ledger_hours")]
    pub ledger_hours: u32,
    /// How long hourly log entries are kept. Must cover the widest window.
    #[serde(default = "default_log_days")]
    pub log_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ledger_hours: default_ledger_hours(),
            log_days: default_log_days(),
        }
    }
}

fn default_ledger_hours() -> u32 {
    48
}
fn default_log_days() -> u32 {
    95
}

impl RetentionConfig {
    pub fn ledger_horizon(&self) -> Duration {
        Duration::hours(i64::from(self.ledger_hours))
    }

    pub fn log_max_age(&self) -> Duration {
        Duration::days(i64::from(self.log_days))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    15
}
fn default_user_agent() -> String {
    concat!("keyword-trends/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Top-N shown per ranking in the rendered report.
    #[serde(default = "default_report_limit")]
    pub limit: usize,
    /// Max keywords persisted per (window, source). `None` stores everything.
    #[serde(default = "default_store_limit")]
    pub store_limit: Option<usize>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            limit: default_report_limit(),
            store_limit: default_store_limit(),
        }
    }
}

fn default_report_limit() -> usize {
    10
}
fn default_store_limit() -> Option<usize> {
    Some(100)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    pub name: String,
    pub hours: u32,
}

impl WindowConfig {
    pub fn new(name: impl Into<String>, hours: u32) -> Self {
        Self {
            name: name.into(),
            hours,
        }
    }

    pub fn span(&self) -> Duration {
        Duration::hours(i64::from(self.hours))
    }
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig::new("24h", 24),
        WindowConfig::new("1month", 30 * 24),
        WindowConfig::new("3month", 90 * 24),
    ]
}

/// Keyword dictionary for the built-in extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordsConfig {
    #[serde(default)]
    pub terms: Vec<String>,
    /// canonical term -> alternative spellings
    #[serde(default)]
    pub aliases: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Webhook URL, or "ENV" to read `$DISCORD_WEBHOOK_URL`.
    #[serde(default)]
    pub discord_webhook: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
    /// Total attempts per message, first try included. Must be 1..=10.
    #[serde(default = "default_notify_retries")]
    pub max_retries: u8,
}

const MAX_NOTIFY_ATTEMPTS: u8 = 10;

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            discord_webhook: None,
            timeout_secs: default_notify_timeout(),
            max_retries: default_notify_retries(),
        }
    }
}

fn default_notify_timeout() -> u64 {
    5
}
fn default_notify_retries() -> u8 {
    3
}

impl AppConfig {
    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Load using `$TRENDS_CONFIG_PATH`, then `config/trends.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load_from(&resolve_config_path()?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s).context("parsing config toml")?;
        cfg.resolve_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_env(&mut self) -> Result<()> {
        if let Some(hook) = &self.notify.discord_webhook {
            let hook = hook.trim();
            if hook.is_empty() {
                self.notify.discord_webhook = None;
            } else if hook.eq_ignore_ascii_case("env") {
                let v = std::env::var(ENV_DISCORD_WEBHOOK)
                    .map_err(|_| anyhow!("Missing {ENV_DISCORD_WEBHOOK} env var"))?;
                self.notify.discord_webhook = Some(v);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.windows.is_empty() {
            bail!("at least one [[windows]] entry is required");
        }
        let mut names = HashSet::new();
        for w in &self.windows {
            if w.name.trim().is_empty() {
                bail!("window name must not be empty");
            }
            if w.hours == 0 {
                bail!("window {:?} must span at least one hour", w.name);
            }
            if !names.insert(w.name.as_str()) {
                bail!("duplicate window name {:?}", w.name);
            }
        }

        let mut feeds = HashSet::new();
        for f in &self.feeds {
            if f.name.trim().is_empty() {
                bail!("feed name must not be empty");
            }
            if f.name == TOTAL_SOURCE {
                bail!("feed name {TOTAL_SOURCE:?} is reserved for the aggregate bucket");
            }
            if !feeds.insert(f.name.as_str()) {
                bail!("duplicate feed name {:?}", f.name);
            }
        }

        if !(1..=MAX_NOTIFY_ATTEMPTS).contains(&self.notify.max_retries) {
            bail!(
                "notify.max_retries must be between 1 and {MAX_NOTIFY_ATTEMPTS}, got {}",
                self.notify.max_retries
            );
        }

        if self.retention.ledger_hours == 0 {
            bail!("retention.ledger_hours must be positive");
        }
        let widest = self.windows.iter().map(|w| w.hours).max().unwrap_or(0);
        if self.retention.log_max_age() < Duration::hours(i64::from(widest)) {
            tracing::warn!(
                log_days = self.retention.log_days,
                widest_window_hours = widest,
                "log retention is shorter than the widest window; it will under-count"
            );
        }
        Ok(())
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
    }
    let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
    if pb.exists() {
        return Ok(pb);
    }
    bail!("no config found: set {ENV_CONFIG_PATH} or create {DEFAULT_CONFIG_PATH}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.windows.len(), 3);
        assert_eq!(cfg.windows[0].name, "24h");
        assert_eq!(cfg.retention.ledger_hours, 48);
        assert_eq!(cfg.report.limit, 10);
        assert_eq!(cfg.report.store_limit, Some(100));
        assert!(cfg.feeds.is_empty());
    }

    #[test]
    fn parses_feeds_windows_and_keywords() {
        let cfg = AppConfig::from_toml_str(
            r#"
[retention]
ledger_hours = 24

[[feeds]]
name = "CoinDesk"
url = "https://www.coindesk.com/arc/outboundfeeds/rss/"

[[windows]]
name = "24h"
hours = 24

[keywords]
terms = ["AI", "Bitcoin"]
aliases = { Bitcoin = ["BTC"] }
"#,
        )
        .unwrap();
        assert_eq!(cfg.feeds[0].name, "CoinDesk");
        assert_eq!(cfg.windows, vec![WindowConfig::new("24h", 24)]);
        assert_eq!(cfg.retention.ledger_horizon(), Duration::hours(24));
        assert_eq!(cfg.keywords.aliases["Bitcoin"], vec!["BTC".to_string()]);
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        let total = r#"
[[feeds]]
name = "Total"
url = "http://x"
"#;
        assert!(AppConfig::from_toml_str(total).is_err());

        let dup = r#"
[[windows]]
name = "24h"
hours = 24
[[windows]]
name = "24h"
hours = 48
"#;
        assert!(AppConfig::from_toml_str(dup).is_err());

        let zero = r#"
[[windows]]
name = "now"
hours = 0
"#;
        assert!(AppConfig::from_toml_str(zero).is_err());
    }

    #[test]
    fn notify_attempts_must_be_in_range() {
        assert!(AppConfig::from_toml_str("[notify]\nmax_retries = 0\n").is_err());
        assert!(AppConfig::from_toml_str("[notify]\nmax_retries = 40\n").is_err());
        let cfg = AppConfig::from_toml_str("[notify]\nmax_retries = 10\n").unwrap();
        assert_eq!(cfg.notify.max_retries, 10);
    }

    #[serial_test::serial]
    #[test]
    fn webhook_env_marker_is_resolved() {
        env::set_var(ENV_DISCORD_WEBHOOK, "https://discord.test/hook");
        let cfg = AppConfig::from_toml_str("[notify]\ndiscord_webhook = \"ENV\"\n").unwrap();
        assert_eq!(
            cfg.notify.discord_webhook.as_deref(),
            Some("https://discord.test/hook")
        );
        env::remove_var(ENV_DISCORD_WEBHOOK);
        assert!(AppConfig::from_toml_str("[notify]\ndiscord_webhook = \"ENV\"\n").is_err());
    }

    #[serial_test::serial]
    #[test]
    fn missing_config_is_an_error() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        assert!(AppConfig::load_default().is_err());

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "[report]\nlimit = 3\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.report.limit, 3);
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
