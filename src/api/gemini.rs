use crate::api::ApiKeyPool;
use crate::{logi, logw};
use anyhow::{Context, Result};
use backon::{ConstantBuilder, ExponentialBuilder, Retryable};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const TEXT_RETRIES: usize = 5;
const IMAGE_RETRIES: usize = 3;
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Thin `generateContent` client over a shared key pool.
#[derive(Clone)]
pub struct Gemini {
    client: Client,
    keys: Arc<ApiKeyPool>,
}

impl Gemini {
    pub fn new(client: Client, keys: Arc<ApiKeyPool>) -> Self {
        Self { client, keys }
    }

    /// Client over `keys`, starting at `start` (wrapped to the pool size).
    pub fn from_keys(keys: Vec<String>, start: usize) -> Result<Self> {
        let pool = ApiKeyPool::new(keys, start)?;
        logi(format!(
            "Found {} Gemini API key(s), starting with key #{}",
            pool.len(),
            pool.current_index() + 1
        ));
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(client, Arc::new(pool)))
    }

    pub fn keys(&self) -> &ApiKeyPool {
        &self.keys
    }

    /// One `generateContent` call with an explicit key. Non-2xx responses
    /// become errors carrying the status and body so quota detection can
    /// see them.
    async fn generate_content(&self, key: &str, model: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}:generateContent", API_BASE, model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .with_context(|| format!("Gemini request to {} failed", model))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Gemini HTTP {} ({}): {}", status.as_u16(), model, text);
        }
        serde_json::from_str(&text).context("Gemini returned invalid JSON")
    }

    /// Same request with quota rotation across the pool.
    pub async fn request(&self, model: &str, body: Value) -> Result<Value> {
        let body = &body;
        self.keys
            .with_rotation(|key| async move { self.generate_content(&key, model, body).await })
            .await
    }

    /// Plain text completion, retried with exponential back-off. Quota
    /// exhaustion is returned immediately.
    pub async fn generate_text(&self, model: &str, prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        (|| async {
            let resp = self.request(model, body.clone()).await?;
            extract_text(&resp).context("Gemini response had no text")
        })
        .retry(text_backoff())
        .when(|e: &anyhow::Error| !crate::error::is_fatal(e))
        .notify(|err: &anyhow::Error, dur: Duration| {
            logw(format!(
                "Gemini {} failed, retrying after {:.0}s: {:#}",
                model,
                dur.as_secs_f64(),
                err
            ));
        })
        .await
    }

    /// Image generation. Server errors (HTTP 500) are retried after a pause.
    pub async fn generate_image(&self, model: &str, prompt: &str) -> Result<Vec<u8>> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
        });

        let resp = (|| async { self.request(model, body.clone()).await })
            .retry(image_backoff())
            .when(|e: &anyhow::Error| !crate::error::is_fatal(e) && is_server_error(e))
            .notify(|_: &anyhow::Error, dur: Duration| {
                logw(format!("Server error (500), retrying in {:.0}s", dur.as_secs_f64()));
            })
            .await?;

        if let Some((_, bytes)) = extract_inline_data(&resp)? {
            return Ok(bytes);
        }
        if let Some(text) = extract_text(&resp) {
            logi(format!("Image model replied with text only: {}", text));
        }
        anyhow::bail!("Gemini {} returned no image", model)
    }
}

/// 1s, 2s, 4s, 8s between five text attempts.
fn text_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_times(TEXT_RETRIES - 1)
}

fn image_backoff() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(Duration::from_secs(5))
        .with_max_times(IMAGE_RETRIES - 1)
}

fn is_server_error(err: &anyhow::Error) -> bool {
    format!("{:#}", err).contains("HTTP 500")
}

fn first_parts(resp: &Value) -> Option<&Vec<Value>> {
    resp.get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()
}

/// Concatenated text parts of the first candidate.
pub fn extract_text(resp: &Value) -> Option<String> {
    let text: String = first_parts(resp)?
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// First inline binary part of the first candidate, decoded.
pub fn extract_inline_data(resp: &Value) -> Result<Option<(String, Vec<u8>)>> {
    let Some(parts) = first_parts(resp) else {
        return Ok(None);
    };
    for part in parts {
        let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
            continue;
        };
        let Some(data) = inline.get("data").and_then(|d| d.as_str()) else {
            continue;
        };
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(|m| m.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = BASE64
            .decode(data)
            .context("Gemini inline data is not valid base64")?;
        return Ok(Some((mime, bytes)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn text_parts_are_joined() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "DISPLAY TITLE: MX Master 3S\n" },
                { "text": "SPOKEN NAME: MX Master" }
            ]}}]
        });
        assert_eq!(
            extract_text(&resp).unwrap(),
            "DISPLAY TITLE: MX Master 3S\nSPOKEN NAME: MX Master"
        );
        assert!(extract_text(&json!({ "candidates": [] })).is_none());
    }

    #[test]
    fn inline_audio_is_decoded() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": BASE64.encode([1u8, 2, 3, 4]) } }
            ]}}]
        });
        let (mime, bytes) = extract_inline_data(&resp).unwrap().unwrap();
        assert_eq!(mime, "audio/L16;rate=24000");
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn text_retries_double_from_one_second() {
        let delays: Vec<Duration> = text_backoff().build().collect();
        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8]);
    }

    #[test]
    fn only_server_errors_retry_images() {
        let delays: Vec<Duration> = image_backoff().build().collect();
        assert_eq!(delays, vec![Duration::from_secs(5); 2]);

        let err = anyhow::anyhow!("Gemini HTTP 500 (img): internal").context("thumbnail");
        assert!(is_server_error(&err));
        assert!(!is_server_error(&anyhow::anyhow!("Gemini HTTP 400 (img): bad")));
    }

    #[test]
    fn bad_base64_is_an_error() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [{ "inlineData": { "data": "***" } }] } }]
        });
        assert!(extract_inline_data(&resp).is_err());
        assert!(extract_inline_data(&json!({})).unwrap().is_none());
    }
}
