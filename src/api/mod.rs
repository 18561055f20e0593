pub mod applio;
pub mod comfyui;
pub mod fooocus;
pub mod gemini;
pub mod openai;

use crate::error::{ServiceError, ServiceErrorKind};
use rand::Rng;
use rand::distributions::Alphanumeric;

const BODY_SNIPPET_CHARS: usize = 800;

/// Turn a non-success response into a classified service error.
pub(crate) async fn failure(service: &'static str, resp: reqwest::Response) -> ServiceError {
    let status = resp.status().as_u16();
    let raw = resp.text().await.unwrap_or_default();
    ServiceError::from_status(service, status, error_message(&raw))
}

pub(crate) fn transport(service: &'static str, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        return ServiceError::transport(service, format!("request timed out: {err}"))
            .with_kind(ServiceErrorKind::Timeout);
    }
    ServiceError::transport(service, err.to_string())
}

/// Pull `error.status` and `error.message` out of a JSON error body, falling
/// back to a trimmed copy of the raw text.
pub(crate) fn error_message(raw: &str) -> String {
    if let Ok(root) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(err) = root.get("error") {
            let status = err.get("status").and_then(|v| v.as_str());
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .or_else(|| err.as_str());
            match (status, message) {
                (Some(s), Some(m)) => return format!("{s}: {m}"),
                (None, Some(m)) => return m.to_string(),
                (Some(s), None) => return s.to_string(),
                (None, None) => {}
            }
        }
    }
    raw.chars().take(BODY_SNIPPET_CHARS).collect()
}

/// Random alphanumeric id for Gradio's `session_hash`.
pub fn session_hash(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Cut `input` to at most `max_chars` characters, marking the cut.
pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &input[..cut]),
        None => input.to_string(),
    }
}
