// src/ingest/providers/rss.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;

use crate::config::{FeedConfig, FetchConfig};
use crate::ingest::normalize_text;
use crate::ingest::types::{Article, FeedProvider};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RSS 2.0 feed, either downloaded over HTTP or parsed from an in-memory fixture.
pub struct RssFeedProvider {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl RssFeedProvider {
    pub fn from_fixture_str(name: impl Into<String>, xml: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(
        name: impl Into<String>,
        url: impl Into<String>,
        fetch: &FetchConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .user_agent(fetch.user_agent.clone())
            .build()
            .context("building feed http client")?;
        Ok(Self {
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client,
            },
        })
    }

    pub fn from_config(feed: &FeedConfig, fetch: &FetchConfig) -> Result<Self> {
        Self::from_url(feed.name.clone(), feed.url.clone(), fetch)
    }

    /// Parse an RSS document into articles tagged with `source`.
    /// Items without an id (guid or link) or without text are dropped.
    pub fn parse_items(source: &str, xml: &str) -> Result<Vec<Article>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).with_context(|| format!("parsing {source} rss xml"))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let id = it
                .guid
                .map(|g| g.value.trim().to_string())
                .filter(|g| !g.is_empty())
                .or_else(|| it.link.as_deref().map(str::trim).map(str::to_string))
                .filter(|id| !id.is_empty());
            let Some(id) = id else {
                tracing::debug!(feed = source, "rss item without guid/link, skipping");
                continue;
            };

            let text_raw = format!(
                "{}. {}",
                it.title.as_deref().unwrap_or_default(),
                it.description.as_deref().unwrap_or_default()
            );
            let raw_text = normalize_text(&text_raw);
            if raw_text.is_empty() {
                continue;
            }

            out.push(Article {
                id,
                source: source.to_string(),
                raw_text,
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        Ok(out)
    }
}

#[async_trait]
impl FeedProvider for RssFeedProvider {
    async fn fetch_articles(&self) -> Result<Vec<Article>> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_items(&self.name, s),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("{} http get()", self.name))?;
                let body = resp
                    .error_for_status()
                    .with_context(|| format!("{} http status", self.name))?
                    .text()
                    .await
                    .with_context(|| format!("{} http .text()", self.name))?;
                Self::parse_items(&self.name, &body)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example</title>
    <item>
      <title>AI&nbsp;meets Bitcoin</title>
      <link>https://news.test/a</link>
      <guid isPermaLink="false">guid-a</guid>
      <dc:creator>Someone</dc:creator>
      <pubDate>Sat, 10 May 2025 09:00:00 +0000</pubDate>
      <description><![CDATA[<p>Stablecoin &amp; <b>DeFi</b> news</p>]]></description>
    </item>
    <item>
      <title>Link only</title>
      <link>https://news.test/b</link>
    </item>
    <item>
      <title>No id at all</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_ids_text_and_dates() {
        let items = RssFeedProvider::parse_items("Example", XML).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].id, "guid-a");
        assert_eq!(items[0].source, "Example");
        assert!(items[0].raw_text.contains("AI meets Bitcoin"));
        assert!(items[0].raw_text.contains("Stablecoin & DeFi news"));
        assert!(!items[0].raw_text.contains('<'));
        assert!(items[0].published_at.is_some());

        assert_eq!(items[1].id, "https://news.test/b");
        assert!(items[1].published_at.is_none());
    }

    #[test]
    fn empty_channel_is_ok() {
        let xml = r#"<rss version="2.0"><channel><title>x</title></channel></rss>"#;
        assert!(RssFeedProvider::parse_items("x", xml).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(RssFeedProvider::parse_items("x", "<html><body>oops").is_err());
    }
}
