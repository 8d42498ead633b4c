//! Text-understanding capability: submit a prompt, receive text.
//!
//! Every component that asks an LLM for structured output goes through
//! [`complete_json`], which isolates the JSON object in the reply and decodes it
//! into the caller's typed schema. Callers own the fallback on any error.

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::CapabilityError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait TextCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, CapabilityError>;
}

/// Stand-in used when no LLM endpoint is configured or LLM processing is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledLlm;

#[async_trait]
impl TextCapability for DisabledLlm {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Disabled("llm".to_string()))
    }
}

pub struct OpenAiCompatibleLlm {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    temperature: f32,
}

impl OpenAiCompatibleLlm {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            retry: RetryPolicy::default(),
            temperature: 0.1,
        }
    }

    /// Client for `endpoint` using the configured model, key, retry policy and temperature.
    pub fn from_config(endpoint: impl Into<String>, config: &EngineConfig) -> Self {
        Self::new(endpoint, config.llm_model.clone(), config.llm_api_key.clone())
            .with_retry(config.retry)
            .with_temperature(config.llm_temperature)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn send_once(&self, system: &str, prompt: &str) -> Result<String, CapabilityError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&json!({
                "model": self.model,
                "temperature": self.temperature,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": prompt },
                ],
            }));

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CapabilityError::RateLimited {
                service: self.endpoint.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status {
                service: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CapabilityError::Malformed("completion had no message content".to_string()))
    }
}

#[async_trait]
impl TextCapability for OpenAiCompatibleLlm {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, CapabilityError> {
        retry_with_backoff(&self.retry, &self.endpoint, || self.send_once(system, prompt)).await
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are spent.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(%label, attempt, delay_ms = delay.as_millis() as u64, %error, "retrying external call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Asks for a JSON reply and decodes it into `T`. Prose or code fences around the
/// object are tolerated; anything else is `Malformed`.
pub async fn complete_json<T: DeserializeOwned>(
    capability: &dyn TextCapability,
    system: &str,
    prompt: &str,
) -> Result<T, CapabilityError> {
    let reply = capability.complete(system, prompt).await?;
    let object = extract_json_object(&reply)
        .ok_or_else(|| CapabilityError::Malformed("reply contained no JSON object".to_string()))?;
    debug!(capability = capability.name(), bytes = object.len(), "decoding structured reply");
    serde_json::from_str(object).map_err(|error| CapabilityError::Malformed(error.to_string()))
}

/// First balanced `{...}` in `text`, honouring string literals and escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLlm(String);

    #[async_trait]
    impl TextCapability for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Verdict {
        label: String,
    }

    #[test]
    fn json_object_is_found_inside_fenced_prose() {
        let reply = "Sure! ```json\n{\"label\": \"a {brace} in \\\"text\\\"\", \"n\": {\"x\": 1}}\n``` done";
        let object = extract_json_object(reply).expect("object present");
        let value: Value = serde_json::from_str(object).expect("valid json");
        assert_eq!(value["n"]["x"], 1);
    }

    #[test]
    fn client_takes_its_settings_from_the_engine_config() {
        let config = EngineConfig {
            llm_model: "local-model".to_string(),
            llm_temperature: 0.7,
            retry: RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let llm = OpenAiCompatibleLlm::from_config("http://localhost:8080/v1/", &config);

        assert_eq!(llm.endpoint, "http://localhost:8080/v1/chat/completions");
        assert_eq!(llm.model, "local-model");
        assert_eq!(llm.temperature, 0.7);
        assert_eq!(llm.retry.max_attempts, 5);
    }

    #[test]
    fn unbalanced_json_is_rejected() {
        assert!(extract_json_object("{\"open\": true").is_none());
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn complete_json_decodes_typed_reply() {
        let llm = ScriptedLlm("Here you go: {\"label\": \"clear\"}".to_string());
        let verdict: Verdict = complete_json(&llm, "sys", "prompt").await.expect("decodes");
        assert_eq!(verdict.label, "clear");
    }

    #[tokio::test]
    async fn complete_json_reports_malformed_reply() {
        let llm = ScriptedLlm("I cannot answer that".to_string());
        let result: Result<Verdict, _> = complete_json(&llm, "sys", "prompt").await;
        assert!(matches!(result, Err(CapabilityError::Malformed(_))));
    }

    #[tokio::test]
    async fn retries_only_retryable_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::RateLimited { service: "x".to_string() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Status {
                service: "x".to_string(),
                status: 400,
                body: "bad request".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_llm_always_fails() {
        assert!(DisabledLlm.complete("s", "p").await.is_err());
    }
}
