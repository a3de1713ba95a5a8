use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;

use crate::backend::{
    BackendError, ConversionBackend, ConversionOutput, PerformanceProfile, ProgressSender,
};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

impl ProviderResponse {
    /// Providers have shipped the link under several field names over time;
    /// take the first non-empty one.
    fn resolve_link(&self) -> Option<&str> {
        [&self.link, &self.url, &self.download_url]
            .into_iter()
            .filter_map(|field| field.as_deref())
            .map(str::trim)
            .find(|link| !link.is_empty())
    }
}

/// Remote-API backend: asks an external conversion provider for a download
/// link, then fetches the audio bytes from it.
pub struct RemoteProviderBackend {
    client: reqwest::Client,
    base_url: String,
    host: String,
    api_key: Option<String>,
}

impl RemoteProviderBackend {
    pub fn new(
        base_url: String,
        host: String,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host,
            api_key,
        })
    }

    async fn request_conversion(&self, video_id: &str) -> Result<ProviderResponse, BackendError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| {
                BackendError::Configuration(
                    "Provider API key is not configured (YTAUDIO_PROVIDER_API_KEY).".to_string(),
                )
            })?;

        let url = format!("{}/dl?id={video_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-RapidAPI-Key", key)
            .header("X-RapidAPI-Host", &self.host)
            .send()
            .await
            .map_err(|err| classify_http_error("provider request", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("provider returned {status}: {}", truncate(&body, 200));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                BackendError::Transient(message)
            } else {
                BackendError::Permanent(message)
            });
        }

        response
            .json::<ProviderResponse>()
            .await
            .map_err(|err| BackendError::Transient(format!("provider response decode failed: {err}")))
    }

    async fn download_audio(&self, link: &str) -> Result<Bytes, BackendError> {
        let response = self
            .client
            .get(link)
            .header("Referer", format!("{}/", self.base_url))
            .header("Accept", "audio/mpeg, audio/*")
            .send()
            .await
            .map_err(|err| classify_http_error("artifact download", err))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("artifact download failed: {status}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                BackendError::Transient(message)
            } else {
                BackendError::Permanent(message)
            });
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|len| len as usize)
                .unwrap_or(1 << 20),
        );
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| BackendError::Transient(format!("artifact stream failed: {err}")))?;
            buf.extend_from_slice(&chunk);
        }
        if buf.is_empty() {
            return Err(BackendError::Transient(
                "artifact download produced zero bytes".to_string(),
            ));
        }
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ConversionBackend for RemoteProviderBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn convert(
        &self,
        video_id: &str,
        _profile: &PerformanceProfile,
        progress: ProgressSender,
    ) -> Result<ConversionOutput, BackendError> {
        let _ = progress.send(20).await;

        let payload = self.request_conversion(video_id).await?;
        if let Some(status) = payload.status.as_deref() {
            if !matches!(status, "ok" | "success" | "processing") {
                let detail = payload.msg.as_deref().unwrap_or(status);
                return Err(crate::backend::classify_diagnostic(&format!(
                    "provider rejected conversion: {detail}"
                )));
            }
        }

        let link = payload.resolve_link().ok_or_else(|| {
            BackendError::Transient("provider response carried no download link".to_string())
        })?;
        let _ = progress.send(60).await;

        let bytes = self.download_audio(link).await?;
        let _ = progress.send(90).await;

        let title = payload
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "YouTube Audio".to_string());

        Ok(ConversionOutput { bytes, title })
    }
}

// Transport-level reqwest failures (connect, timeout, reset) are all worth
// another attempt.
fn classify_http_error(stage: &str, err: reqwest::Error) -> BackendError {
    BackendError::Transient(format!("{stage} failed: {err}"))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_resolution_prefers_first_present_field() {
        let payload: ProviderResponse = serde_json::from_str(
            r#"{"status":"ok","title":"T","url":"https://cdn.example/a.mp3"}"#,
        )
        .unwrap();
        assert_eq!(payload.resolve_link(), Some("https://cdn.example/a.mp3"));

        let payload: ProviderResponse =
            serde_json::from_str(r#"{"status":"ok","download_url":"https://cdn.example/b.mp3"}"#)
                .unwrap();
        assert_eq!(payload.resolve_link(), Some("https://cdn.example/b.mp3"));

        let payload: ProviderResponse = serde_json::from_str(
            r#"{"status":"ok","link":"","url":"https://cdn.example/c.mp3"}"#,
        )
        .unwrap();
        assert_eq!(payload.resolve_link(), Some("https://cdn.example/c.mp3"));

        let payload: ProviderResponse = serde_json::from_str(r#"{"status":"ok","link":""}"#).unwrap();
        assert_eq!(payload.resolve_link(), None);
    }

    #[test]
    fn provider_failure_status_classifies_from_message() {
        let err = crate::backend::classify_diagnostic("provider rejected conversion: Video unavailable");
        assert!(!err.is_retryable());
    }
}
