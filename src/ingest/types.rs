// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Article {
    pub id: String,                          // article URL or GUID
    pub source: String,                      // feed name, e.g. "CoinDesk"
    pub raw_text: String,                    // normalized title + summary
    pub published_at: Option<DateTime<Utc>>, // informational only
}

#[async_trait::async_trait]
pub trait FeedProvider: Send + Sync {
    async fn fetch_articles(&self) -> Result<Vec<Article>>;
    fn name(&self) -> &str;
}
