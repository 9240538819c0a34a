// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{Article, ArticleId};

/// One entry as it comes out of a feed, before normalization.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RawEntry {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: Option<String>,
    /// RFC 2822 as found in `<pubDate>`.
    pub published: Option<String>,
    pub image_url: Option<String>,
}

impl RawEntry {
    /// Normalize into an [`Article`]. Missing optional fields are defaulted, never fatal.
    pub fn into_article(self, source_name: &str, language: &str, now: DateTime<Utc>) -> Article {
        let title = self
            .title
            .as_deref()
            .map(super::normalize_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());
        let body = self
            .summary
            .as_deref()
            .map(super::normalize_text)
            .unwrap_or_default();

        let published_at = match self.published.as_deref().map(parse_rfc2822) {
            Some(Some(ts)) => ts,
            Some(None) => {
                tracing::debug!(target: "ingest", source = source_name, "unparsable pubDate, using fetch time");
                now
            }
            None => now,
        };

        Article {
            id: ArticleId::new(),
            title,
            body,
            link: self.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
            source_name: source_name.to_string(),
            published_at,
            fetched_at: now,
            language: language.to_string(),
            image_urls: self.image_url.into_iter().collect(),
        }
    }
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Feed fetching capability. Retries, if any, belong to the implementation.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawEntry>>;
    fn name(&self) -> &str;
    /// Language of the feed's content.
    fn language(&self) -> &str {
        "en"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_fields_are_defaulted() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let a = RawEntry::default().into_article("IGN", "en", now);
        assert_eq!(a.title, "Untitled");
        assert_eq!(a.body, "");
        assert_eq!(a.published_at, now);
        assert!(a.link.is_none());
    }

    #[test]
    fn rfc2822_dates_are_parsed() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let raw = RawEntry {
            title: Some("Patch notes".into()),
            published: Some("Sat, 01 Mar 2025 10:30:00 +0100".into()),
            ..Default::default()
        };
        let a = raw.into_article("Polygon", "en", now);
        assert_eq!(a.published_at, Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap());
    }

    #[test]
    fn garbage_dates_fall_back_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let raw = RawEntry {
            title: Some("x".into()),
            published: Some("yesterday-ish".into()),
            ..Default::default()
        };
        assert_eq!(raw.into_article("Kotaku", "en", now).published_at, now);
    }
}
