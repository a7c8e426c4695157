use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-style `/api/generate` endpoint on localhost.
///
/// The endpoint is treated as a stateless request/response service:
/// concurrent sessions simply issue independent requests, no locking.
pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            // Explicit per-request bound; there is no "wait forever" mode.
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send one prompt and return the raw model text.
    pub async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        debug!(model = %self.model, prompt_chars = prompt.chars().count(), "inference request");

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(InferenceError::from_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Http(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(InferenceError::from_request_error)?;

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Malformed(format!("{}: {}", e, truncate(&text, 200))))?;

        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let text = r#"{"model":"qwen2.5-coder:0.5b","response":"```python\nx = 1\n```","done":true}"#;
        let parsed: GenerateResponse = serde_json::from_str(text).unwrap();
        assert!(parsed.response.contains("x = 1"));
    }

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"stream\":false"));
        assert!(json.contains("\"model\":\"m\""));
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let config = InferenceConfig {
            endpoint: "http://127.0.0.1:11434/".to_string(),
            ..InferenceConfig::default()
        };
        let client = InferenceClient::new(&config);
        assert_eq!(client.endpoint, "http://127.0.0.1:11434");
    }
}
