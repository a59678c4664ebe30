//! OpenAI-compatible chat-completions backend

use super::{BackendError, ModelBackend};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// A string wrapper that redacts its value in Debug and Display output
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Access the secret value (only for request headers)
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Backend for any `/v1/chat/completions` endpoint
#[derive(Debug)]
pub struct ChatCompletionsBackend {
    model: String,
    base_url: String,
    api_key: SecretString,
    client: reqwest::Client,
    timeout: Duration,
}

impl ChatCompletionsBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: "https://api.openai.com".to_string(),
            api_key: SecretString::new(api_key),
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = normalize_base_url(base_url.as_ref());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Strip trailing `/` and `/v1` so the path can be appended uniformly
fn normalize_base_url(base_url: &str) -> String {
    base_url
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .trim_end_matches('/')
        .to_string()
}

/// Request body for a single-turn completion
pub fn build_request_body(model: &str, prompt: &str, structured: bool) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
    });
    if structured {
        body["response_format"] = serde_json::json!({"type": "json_object"});
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    /// Some reasoning models put the answer here
    reasoning_content: Option<String>,
}

/// Pull the first choice's text out of a success body
pub fn parse_response(body: &str) -> Result<String, BackendError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Other(format!("Failed to parse completion: {}", e)))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::Other("Completion had no choices".to_string()))?;
    choice
        .message
        .content
        .filter(|c| !c.is_empty())
        .or(choice.message.reasoning_content)
        .ok_or_else(|| BackendError::Other("Completion had no content".to_string()))
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    async fn complete(&self, prompt: &str, structured: bool) -> Result<String, BackendError> {
        let url = self.endpoint();
        let body = build_request_body(&self.model, prompt, structured);
        tracing::debug!(url = %url, model = %self.model, structured, "POST chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Other(format!("Failed to send request to {}: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Other(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(BackendError::classify(status.as_u16(), &text));
        }
        parse_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacted() {
        let backend = ChatCompletionsBackend::new("sk-live-123", "gpt-4o-mini");
        let debug = format!("{:?}", backend);
        assert!(!debug.contains("sk-live-123"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(format!("{}", SecretString::new("x")), "[REDACTED]");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://localhost:8080/v1/"), "http://localhost:8080");
        assert_eq!(normalize_base_url("https://api.example.com"), "https://api.example.com");
        let backend = ChatCompletionsBackend::new("k", "m").with_base_url("http://h/v1");
        assert_eq!(backend.endpoint(), "http://h/v1/chat/completions");
    }

    #[test]
    fn test_request_body_structured_flag() {
        let plain = build_request_body("m", "hi", false);
        assert!(plain.get("response_format").is_none());
        assert_eq!(plain["messages"][0]["content"], "hi");

        let json = build_request_body("m", "hi", true);
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"42"}}]}"#;
        assert_eq!(parse_response(body).unwrap(), "42");

        let reasoning = r#"{"choices":[{"message":{"content":"","reasoning_content":"r"}}]}"#;
        assert_eq!(parse_response(reasoning).unwrap(), "r");

        assert!(parse_response(r#"{"choices":[]}"#).is_err());
        assert!(parse_response("not json").is_err());
    }
}
