// src/extract.rs
//! Keyword extraction.
//!
//! The pipeline only needs "text in, keyword occurrences out". The built-in
//! [`DictionaryExtractor`] matches a configured term list (plus aliases) and
//! reports the canonical term once per occurrence.
//!
//! Notes:
//! - Matching is case-insensitive.
//! - Word boundaries are ASCII-only, so `AI` matches inside `AIの` but not
//!   inside `MAIL`. Terms that start or end with a non-ASCII character have no
//!   boundary on that side (CJK text has no spaces between words).

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::KeywordsConfig;
use crate::hourly_log::KeywordCounts;

pub trait KeywordExtractor: Send + Sync {
    /// Keyword surface forms, one item per occurrence.
    fn extract(&self, text: &str) -> Vec<String>;
}

#[derive(Debug, Clone)]
struct Term {
    canonical: String,
    re: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct DictionaryExtractor {
    terms: Vec<Term>,
}

impl DictionaryExtractor {
    pub fn from_config(cfg: &KeywordsConfig) -> Result<Self> {
        let mut canon: Vec<&str> = Vec::new();
        for t in cfg.terms.iter().chain(cfg.aliases.keys()) {
            let t = t.trim();
            if !t.is_empty() && !canon.contains(&t) {
                canon.push(t);
            }
        }

        let mut terms = Vec::with_capacity(canon.len());
        for c in canon {
            let mut forms = vec![c];
            if let Some(alts) = cfg.aliases.get(c) {
                forms.extend(alts.iter().map(|a| a.trim()).filter(|a| !a.is_empty()));
            }
            let re = build_pattern(&forms)
                .with_context(|| format!("compiling keyword pattern for {c:?}"))?;
            terms.push(Term {
                canonical: c.to_string(),
                re,
            });
        }
        Ok(Self { terms })
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl KeywordExtractor for DictionaryExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for term in &self.terms {
            let n = term.re.find_iter(text).count();
            out.extend(std::iter::repeat(term.canonical.clone()).take(n));
        }
        out
    }
}

fn build_pattern(forms: &[&str]) -> Result<Regex> {
    let alts: Vec<String> = forms
        .iter()
        .map(|f| {
            let lead = if starts_ascii_word(f) { r"(?-u:\b)" } else { "" };
            let trail = if ends_ascii_word(f) { r"(?-u:\b)" } else { "" };
            format!("{lead}{}{trail}", regex::escape(f))
        })
        .collect();
    Ok(Regex::new(&format!("(?i)(?:{})", alts.join("|")))?)
}

fn starts_ascii_word(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ends_ascii_word(s: &str) -> bool {
    s.chars().last().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Counter-style tally of keyword occurrences.
pub fn tally<I, S>(keywords: I) -> KeywordCounts
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut counts = KeywordCounts::new();
    for kw in keywords {
        *counts.entry(kw.into()).or_insert(0) += 1;
    }
    counts
}
