use anyhow::{anyhow, Result};
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::NotifyConfig;
use crate::report::split_blocks;

/// Discord rejects `content` longer than this.
pub const DISCORD_CONTENT_LIMIT: usize = 2000;

/// Backoff stops growing after this many doublings.
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

#[derive(Clone)]
pub struct DiscordNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    backoff: Duration,
}

impl DiscordNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }

    /// `None` when no webhook is configured.
    pub fn from_config(cfg: &NotifyConfig) -> Option<Self> {
        let hook = cfg.discord_webhook.clone()?;
        Some(
            Self::new(hook)
                .with_timeout(cfg.timeout_secs)
                .with_retries(cfg.max_retries),
        )
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Total attempts per message. `0` is treated as `1`.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Base delay between attempts; doubled after each failure.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff = base;
        self
    }

    /// Post a rendered report, one message per window block (split further if
    /// a block is over the Discord limit). Stops at the first message that
    /// still fails after retries. Returns the number of messages sent.
    pub async fn send_report(&self, report: &str) -> Result<usize> {
        let mut sent = 0;
        for block in split_blocks(report) {
            for chunk in chunk_message(block, DISCORD_CONTENT_LIMIT) {
                if let Err(e) = self.post(&DiscordWebhookPayload { content: chunk }).await {
                    counter!("notify_errors_total").increment(1);
                    return Err(e.context(format!("after {sent} message(s) were delivered")));
                }
                sent += 1;
                counter!("notify_messages_total").increment(1);
            }
        }
        tracing::info!(target: "notify", messages = sent, "report sent to Discord");
        Ok(sent)
    }

    async fn post(&self, payload: &DiscordWebhookPayload<'_>) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("Discord webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("Discord webhook request failed: {e}"),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            tracing::debug!(attempt, error = %err, "Discord post failed, retrying");
            let factor = 1u32 << u32::from(attempt - 1).min(MAX_BACKOFF_DOUBLINGS);
            tokio::time::sleep(self.backoff.saturating_mul(factor)).await;
        }
    }
}

/// Split `text` into pieces of at most `limit` chars, preferring line breaks.
pub fn chunk_message(text: &str, limit: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        // byte offset just past the `limit`-th char
        let hard = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = if rest[hard..].starts_with('\n') {
            hard
        } else {
            match rest[..hard].rfind('\n') {
                Some(nl) if nl > 0 => nl,
                _ => hard,
            }
        };
        out.push(&rest[..cut]);
        rest = rest[cut..].strip_prefix('\n').unwrap_or(&rest[cut..]);
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

#[derive(Serialize)]
struct DiscordWebhookPayload<'a> {
    content: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_message("hello", 2000), vec!["hello"]);
    }

    #[test]
    fn splits_on_newlines_within_limit() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = chunk_message(text, 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn long_line_is_cut_on_char_boundary() {
        let text = "📊".repeat(5);
        let chunks = chunk_message(&text, 2);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 2));
        assert_eq!(chunks.concat(), text);
    }
}
