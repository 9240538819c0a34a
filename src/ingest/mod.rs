// src/ingest/mod.rs
pub mod rss;
pub mod types;

use crate::ingest::types::FeedSource;
use crate::model::Article;
use metrics::{counter, gauge};

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: 4000 chars (Telegram caps a message at 4096)
    if out.chars().count() > 4000 {
        out = out.chars().take(4000).collect();
    }

    out
}

/// Short, stable, anonymized id for log lines. Never log raw article text.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..6])
}

/// Fetch every source once and normalize the entries into articles.
/// A failing source is logged and skipped; the others still contribute.
pub async fn run_once(sources: &[Box<dyn FeedSource>]) -> Vec<Article> {
    crate::metrics::ensure_described();

    let now = chrono::Utc::now();
    let mut out = Vec::new();
    for s in sources {
        match s.fetch().await {
            Ok(entries) => {
                counter!("ingest_events_total").increment(entries.len() as u64);
                out.extend(
                    entries
                        .into_iter()
                        .map(|e| e.into_article(s.name(), s.language(), now)),
                );
            }
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, source = s.name(), "feed error");
                counter!("ingest_provider_errors_total").increment(1);
            }
        }
    }

    gauge!("ingest_last_run_ts").set(now.timestamp() as f64);
    out
}
