use crate::api::{error_message, transport};
use crate::error::{ServiceError, ServiceErrorKind};
use crate::{logi, logw};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

pub const SERVICE: &str = "openai";
pub const BASE_URL: &str = "https://api.openai.com/v1";

const MAX_PROMPT_CHARS: usize = 320_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3_600);

fn trim_copy_utf8_safe(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }

    let mut cut = max_bytes.min(input.len());
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    input[..cut].to_string()
}

fn openai_extract_message_text(resp_json: &str) -> Option<String> {
    let root: serde_json::Value = serde_json::from_str(resp_json).ok()?;

    if let Some(err) = root.get("error") {
        if let Some(msg) = err.get("message").and_then(|v| v.as_str()) {
            logw(format!("OpenAI error message: {}", msg));
        }
        return None;
    }

    root.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// gpt-5 models only accept the default sampling temperature.
fn supports_temperature(model: &str) -> bool {
    !model.starts_with("gpt-5")
}

/// Classify a chat-completions failure. Every 5xx is worth retrying here.
fn classify(status: u16, raw: &str) -> ServiceError {
    let err = ServiceError::from_status(SERVICE, status, error_message(raw));
    if status >= 500 {
        return err.with_kind(ServiceErrorKind::Unavailable);
    }
    err
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(http: Client, api_key: impl Into<String>) -> Self {
        Self::with_base_url(http, BASE_URL, api_key)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub async fn chat(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<String, ServiceError> {
        let prompt = trim_copy_utf8_safe(prompt, MAX_PROMPT_CHARS);

        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if supports_temperature(model) {
            body["temperature"] = json!(0.7);
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            logw(format!("OpenAI HTTP {}", status.as_u16()));
            return Err(classify(status.as_u16(), &raw));
        }

        let Some(text) = openai_extract_message_text(&raw) else {
            logw("OpenAI response parse failed.");
            if !raw.is_empty() {
                let snippet = raw.chars().take(800).collect::<String>();
                logw(format!("OpenAI raw body: {}", snippet));
            }
            return Err(ServiceError::from_message(SERVICE, "response carried no message"));
        };

        logi(format!("OpenAI {} replied with {} chars", model, text.len()));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        assert!(classify(500, "boom").is_unavailable());
        assert!(classify(502, "").is_unavailable());
        assert!(classify(429, "slow down").is_rate_limit());
        assert_eq!(classify(400, "bad").kind, ServiceErrorKind::Other);
    }

    #[test]
    fn temperature_skipped_for_gpt5() {
        assert!(!supports_temperature("gpt-5-mini"));
        assert!(supports_temperature("gpt-4o"));
    }

    #[test]
    fn extracts_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hola"}}]}"#;
        assert_eq!(openai_extract_message_text(raw).as_deref(), Some("hola"));
        assert_eq!(openai_extract_message_text(r#"{"error":{"message":"x"}}"#), None);
    }

    #[test]
    fn trims_on_char_boundary() {
        assert_eq!(trim_copy_utf8_safe("añb", 2), "a");
    }
}
