// src/ingest/providers/mod.rs
pub mod rss;

use anyhow::Result;

use crate::config::AppConfig;
use crate::ingest::types::FeedProvider;
use rss::RssFeedProvider;

/// One HTTP RSS provider per configured feed, in config order.
pub fn from_config(cfg: &AppConfig) -> Result<Vec<Box<dyn FeedProvider>>> {
    let mut out: Vec<Box<dyn FeedProvider>> = Vec::with_capacity(cfg.feeds.len());
    for feed in &cfg.feeds {
        out.push(Box::new(RssFeedProvider::from_config(feed, &cfg.fetch)?));
    }
    Ok(out)
}
