//! Translation gateway.
//!
//! [`AzureTranslator`] speaks the Translator v3 REST contract.
//! [`TranslationGateway`] wraps any [`Translator`] with glossary protection
//! so provider code never sees protected terms.

use super::glossary::Glossary;
use super::pipeline::{TranslationError, Translator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const API_VERSION: &str = "3.0";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

// ── Azure Translator v3 ──────────────────────────────────────────

#[derive(Serialize)]
struct TranslateItem<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct TranslateResult {
    translations: Vec<TranslatedText>,
}

#[derive(Deserialize)]
struct TranslatedText {
    text: String,
}

/// Parse a v3 response body: a list of `{translations: [{text}]}`, one
/// entry per input, first translation of each.
pub fn parse_translations(body: &str, expected: usize) -> Result<Vec<String>, TranslationError> {
    let results: Vec<TranslateResult> =
        serde_json::from_str(body).map_err(|e| TranslationError::Payload(e.to_string()))?;

    if results.len() != expected {
        return Err(TranslationError::LengthMismatch {
            expected,
            actual: results.len(),
        });
    }

    results
        .into_iter()
        .map(|r| {
            r.translations
                .into_iter()
                .next()
                .map(|t| t.text)
                .ok_or_else(|| TranslationError::Payload("entry without translations".into()))
        })
        .collect()
}

/// Azure Translator v3 REST client.
pub struct AzureTranslator {
    endpoint: String,
    key: String,
    region: Option<String>,
    client: reqwest::Client,
}

impl AzureTranslator {
    pub fn new(endpoint: &str, key: &str, region: Option<&str>, timeout_secs: u64) -> Self {
        let timeout_secs = if timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            timeout_secs
        };
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key: key.to_string(),
            region: region.filter(|r| !r.is_empty()).map(str::to_string),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl Translator for AzureTranslator {
    async fn translate(
        &self,
        texts: &[String],
        target: &str,
    ) -> Result<Vec<String>, TranslationError> {
        let url = format!("{}/translate", self.endpoint);
        let body: Vec<TranslateItem<'_>> =
            texts.iter().map(|t| TranslateItem { text: t }).collect();

        let mut request = self
            .client
            .post(&url)
            .query(&[("api-version", API_VERSION), ("to", target)])
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .json(&body);
        if let Some(region) = &self.region {
            request = request.header("Ocp-Apim-Subscription-Region", region);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(TranslationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_translations(&text, texts.len())
    }
}

// ── Glossary-protecting gateway ──────────────────────────────────

/// Bounded retry for a whole translation call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Glossary-aware front of the translation provider.
#[derive(Clone)]
pub struct TranslationGateway {
    inner: Arc<dyn Translator>,
    glossary: Arc<Glossary>,
}

impl TranslationGateway {
    pub fn new(inner: Arc<dyn Translator>, glossary: Arc<Glossary>) -> Self {
        Self { inner, glossary }
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    /// Translate `texts` into `target`, preserving length and order.
    pub async fn translate(
        &self,
        texts: &[String],
        target: &str,
    ) -> Result<Vec<String>, TranslationError> {
        if texts.iter().all(|t| t.is_empty()) {
            return Ok(texts.to_vec());
        }

        let protected: Vec<String> = texts.iter().map(|t| self.glossary.protect(t)).collect();
        let translated = self.inner.translate(&protected, target).await?;
        if translated.len() != texts.len() {
            return Err(TranslationError::LengthMismatch {
                expected: texts.len(),
                actual: translated.len(),
            });
        }
        Ok(translated
            .iter()
            .map(|t| self.glossary.restore(t))
            .collect())
    }

    /// [`Self::translate`] for a single text under `policy`.
    pub async fn translate_one(
        &self,
        text: &str,
        target: &str,
        policy: RetryPolicy,
    ) -> Result<String, TranslationError> {
        let texts = [text.to_string()];
        let mut attempt = 0;
        loop {
            match self.translate(&texts, target).await {
                Ok(mut out) => return Ok(out.pop().unwrap_or_default()),
                Err(e) if attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        target_lang = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Translation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
