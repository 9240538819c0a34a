// src/translate/yandex.rs
//! Yandex Cloud Translate v2 adapter and a pass-through backend.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::TranslationError;
use crate::model::LanguagePair;
use crate::translate::TranslationBackend;

pub const YANDEX_TRANSLATE_URL: &str = "https://translate.api.cloud.yandex.net/translate/v2/translate";

pub struct YandexTranslator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    folder_id: Option<String>,
}

impl YandexTranslator {
    pub fn new(api_key: impl Into<String>, folder_id: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("news-relay/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("building translator http client")?;
        Ok(Self {
            http,
            endpoint: YANDEX_TRANSLATE_URL.to_string(),
            api_key: api_key.into(),
            folder_id: folder_id.filter(|f| !f.trim().is_empty()),
        })
    }

    /// Point at a different endpoint (staging, local mock).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Req<'a> {
    source_language_code: &'a str,
    target_language_code: &'a str,
    texts: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    folder_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct Resp {
    #[serde(default)]
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
    text: String,
}

/// 408, 429 and 5xx are worth retrying; any other non-success is not.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> TranslationError {
    let snippet: String = body.chars().take(200).collect();
    let msg = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        TranslationError::Transient(msg)
    } else {
        TranslationError::Permanent(msg)
    }
}

#[async_trait]
impl TranslationBackend for YandexTranslator {
    async fn translate(&self, text: &str, pair: &LanguagePair) -> Result<String, TranslationError> {
        if self.api_key.is_empty() {
            return Err(TranslationError::Permanent("yandex api key is not configured".into()));
        }

        let req = Req {
            source_language_code: &pair.source,
            target_language_code: &pair.target,
            texts: [text],
            folder_id: self.folder_id.as_deref(),
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .json(&req)
            .send()
            .await
            .map_err(|e| TranslationError::Transient(format!("network error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| TranslationError::Transient(format!("malformed response: {e}")))?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| TranslationError::Transient("no translation in response".into()))
    }

    fn name(&self) -> &str {
        "yandex"
    }
}

/// Returns the input unchanged. Used when no translation backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranslator;

#[async_trait]
impl TranslationBackend for NoopTranslator {
    async fn translate(&self, text: &str, _pair: &LanguagePair) -> Result<String, TranslationError> {
        Ok(text.to_string())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, FailureKind};

    #[test]
    fn status_classification() {
        for (code, kind) in [
            (429, FailureKind::Transient),
            (503, FailureKind::Transient),
            (408, FailureKind::Transient),
            (400, FailureKind::Permanent),
            (401, FailureKind::Permanent),
            (403, FailureKind::Permanent),
            (404, FailureKind::Permanent),
        ] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status, "").kind(), kind, "status {code}");
        }
    }

    #[test]
    fn request_body_matches_api_shape() {
        let req = Req {
            source_language_code: "en",
            target_language_code: "ru",
            texts: ["hi"],
            folder_id: Some("b1g"),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["sourceLanguageCode"], "en");
        assert_eq!(v["texts"][0], "hi");
        assert_eq!(v["folderId"], "b1g");
    }

    #[tokio::test]
    async fn missing_key_is_permanent_without_network() {
        let t = YandexTranslator::new("", None, Duration::from_secs(1)).unwrap();
        let pair = LanguagePair::new("en", "ru").unwrap();
        let err = t.translate("hello", &pair).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn noop_echoes() {
        let pair = LanguagePair::new("en", "ru").unwrap();
        assert_eq!(NoopTranslator.translate("x", &pair).await.unwrap(), "x");
    }
}
