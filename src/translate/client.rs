//! LibreTranslate HTTP client.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Detection, Translate};
use crate::config::Config;
use crate::error::TranslateError;
use crate::shutdown::Shutdown;

/// Client for a LibreTranslate-compatible endpoint.
///
/// By default every request uses a fresh connection so multiple workers
/// spread across replicas behind a load balancer; `persistent_session`
/// switches to pooled connections.
pub struct LibreTranslateClient {
    base_url: String,
    api_key: Option<String>,
    retry_count: u32,
    backoff_delay: Duration,
    http_timeout: Duration,
    translation_timeout: Duration,
    availability_poll: Duration,
    client: reqwest::Client,
    languages: RwLock<Option<HashMap<String, HashSet<String>>>>,
}

impl LibreTranslateClient {
    pub fn new(config: &Config) -> Result<Self, TranslateError> {
        let mut builder = reqwest::Client::builder();
        if !config.persistent_session {
            builder = builder.pool_max_idle_per_host(0);
        }
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retry_count: config.retry_count.max(1),
            backoff_delay: config.backoff_delay,
            http_timeout: config.http_timeout,
            translation_timeout: config.translation_timeout,
            availability_poll: config.availability_poll,
            client: builder.build()?,
            languages: RwLock::new(None),
        })
    }

    /// Queries language support once and caches it for the predicates.
    /// Returns the number of source languages, or 0 when the query failed.
    pub async fn load_languages(&self) -> usize {
        match self.fetch_languages().await {
            Ok(map) => {
                let count = map.len();
                *self.languages.write().unwrap() = Some(map);
                count
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch supported languages; assuming all");
                0
            }
        }
    }

    async fn translate_once(
        &self,
        path: &Path,
        source: &str,
        target: &str,
    ) -> Result<Vec<u8>, TranslateError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "subtitle.srt".to_string());

        let mut form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(filename))
            .text("source", source.to_string())
            .text("target", target.to_string())
            .text("format", "srt");
        if let Some(key) = &self.api_key {
            form = form.text("api_key", key.clone());
        }

        let response = self
            .client
            .post(format!("{}/translate_file", self.base_url))
            .multipart(form)
            .timeout(self.translation_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Translator returned an error");
            return Err(TranslateError::Status {
                status: status.as_u16(),
                message: status_message(status.as_u16(), &body),
            });
        }

        let body = response.bytes().await?;

        // Some deployments answer with a URL to fetch instead of the bytes.
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
            if let Some(url) = json.get("translatedFileUrl").and_then(|v| v.as_str()) {
                debug!(url, "Following translated file URL");
                return self.download(url).await;
            }
        }

        Ok(body.to_vec())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, TranslateError> {
        let response = self
            .client
            .get(url)
            .timeout(self.translation_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Status {
                status: status.as_u16(),
                message: status_message(status.as_u16(), &body),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    #[cfg(test)]
    pub(crate) fn set_languages(&self, map: HashMap<String, HashSet<String>>) {
        *self.languages.write().unwrap() = Some(map);
    }
}

#[async_trait]
impl Translate for LibreTranslateClient {
    async fn translate(
        &self,
        path: &Path,
        source: &str,
        target: &str,
    ) -> Result<Vec<u8>, TranslateError> {
        if !self.supports_translation(source, target) {
            return Err(TranslateError::Unsupported {
                lang_source: source.to_string(),
                target: target.to_string(),
            });
        }
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.translate_once(path, source, target).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.retry_count => {
                    let delay = backoff_for_attempt(self.backoff_delay, attempt);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "Translate attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    error!(attempts = attempt, error = %err, "Translate request exhausted retries");
                    return Err(TranslateError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn detect_language(
        &self,
        sample: &[u8],
        min_confidence: f64,
    ) -> Result<Option<Detection>, TranslateError> {
        let text = String::from_utf8_lossy(sample).to_string();
        let mut params = vec![("q", text)];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let response = self
            .client
            .post(format!("{}/detect", self.base_url))
            .form(&params)
            .timeout(self.http_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslateError::Status {
                status: status.as_u16(),
                message: status_message(status.as_u16(), &body),
            });
        }

        let detections: serde_json::Value = response.json().await?;
        let best = detections
            .as_array()
            .ok_or_else(|| TranslateError::MalformedResponse("expected array".into()))?
            .iter()
            .filter_map(|entry| {
                let language = entry.get("language")?.as_str()?.to_lowercase();
                let confidence = entry.get("confidence")?.as_f64()?;
                Some((language, confidence))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(best.and_then(|(language, raw_confidence)| {
            let confidence = normalize_confidence(raw_confidence);
            if confidence < min_confidence {
                debug!(language = %language, confidence, floor = min_confidence, "Detection below confidence floor");
                None
            } else {
                Some(Detection { language, confidence })
            }
        }))
    }

    async fn fetch_languages(&self) -> Result<HashMap<String, HashSet<String>>, TranslateError> {
        let response = self
            .client
            .get(format!("{}/languages", self.base_url))
            .timeout(self.http_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranslateError::Status {
                status: status.as_u16(),
                message: status_message(status.as_u16(), ""),
            });
        }
        let entries: serde_json::Value = response.json().await?;
        let entries = entries
            .as_array()
            .ok_or_else(|| TranslateError::MalformedResponse("expected array".into()))?;

        let mut map = HashMap::new();
        for entry in entries {
            let Some(code) = entry.get("code").and_then(|v| v.as_str()) else {
                continue;
            };
            let targets: HashSet<String> = entry
                .get("targets")
                .and_then(|v| v.as_array())
                .map(|targets| {
                    targets
                        .iter()
                        .filter_map(|t| t.as_str())
                        .map(|t| t.to_lowercase())
                        .collect()
                })
                .unwrap_or_default();
            map.insert(code.to_lowercase(), targets);
        }
        Ok(map)
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .head(&self.base_url)
            .timeout(self.http_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 400,
            Err(e) => {
                debug!(error = %e, "Translator health probe failed");
                false
            }
        }
    }

    async fn wait_until_available(&self, shutdown: &Shutdown) -> bool {
        loop {
            if shutdown.triggered() {
                return false;
            }
            if self.is_available().await {
                info!("Translator is reachable again");
                return true;
            }
            if shutdown.sleep(self.availability_poll).await {
                return false;
            }
        }
    }

    fn supports_translation(&self, source: &str, target: &str) -> bool {
        match &*self.languages.read().unwrap() {
            Some(map) => map
                .get(source)
                .map(|targets| targets.contains(target))
                .unwrap_or(false),
            // Support unknown until the language list has been fetched.
            None => true,
        }
    }

    fn is_target_supported(&self, target: &str) -> bool {
        match &*self.languages.read().unwrap() {
            Some(map) => map.values().any(|targets| targets.contains(target)),
            None => true,
        }
    }
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(2f64.powi(attempt.saturating_sub(1) as i32))
}

/// LibreTranslate reports confidence as a percentage; normalize to 0..=1.
fn normalize_confidence(raw: f64) -> f64 {
    if raw > 1.0 {
        raw / 100.0
    } else {
        raw
    }
}

fn status_message(status: u16, body: &str) -> String {
    let base = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Server Error",
        _ => "Unexpected error",
    };
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            ["error", "message", "detail"]
                .iter()
                .find_map(|key| json.get(key).and_then(|v| v.as_str()).map(String::from))
        });
    match detail {
        Some(detail) => format!("{base}: {detail}"),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LibreTranslateClient {
        let config = Config::from_lookup(|key| match key {
            "LIBRETRANSLATE_URL" => Some("http://localhost:1".to_string()),
            _ => None,
        })
        .unwrap();
        LibreTranslateClient::new(&config).unwrap()
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_for_attempt(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(base, 4), Duration::from_secs(8));
    }

    #[test]
    fn confidence_percentages_are_normalized() {
        assert_eq!(normalize_confidence(92.0), 0.92);
        assert_eq!(normalize_confidence(0.7), 0.7);
    }

    #[test]
    fn predicates_are_permissive_before_discovery() {
        let client = client();
        assert!(client.supports_translation("en", "nl"));
        assert!(client.is_target_supported("nl"));
    }

    #[test]
    fn predicates_follow_loaded_map() {
        let client = client();
        let mut map = HashMap::new();
        map.insert("en".to_string(), HashSet::from(["nl".to_string(), "es".to_string()]));
        map.insert("es".to_string(), HashSet::from(["en".to_string()]));
        client.set_languages(map);

        assert!(client.supports_translation("en", "nl"));
        assert!(!client.supports_translation("nl", "en"));
        assert!(!client.supports_translation("en", "de"));
        assert!(client.is_target_supported("es"));
        assert!(!client.is_target_supported("de"));
    }

    #[test]
    fn status_messages_include_detail() {
        assert_eq!(status_message(400, ""), "Bad Request");
        assert_eq!(
            status_message(429, r#"{"error": "slow down"}"#),
            "Too Many Requests: slow down"
        );
        assert_eq!(status_message(418, "teapot"), "Unexpected error");
    }
}
