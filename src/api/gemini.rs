use crate::api::{failure, transport, truncate_chars};
use crate::credentials::Connector;
use crate::error::ServiceError;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const SERVICE: &str = "gemini";
pub const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const TTS_MAX_CHARS: usize = 5000;
pub const TTS_SAMPLE_RATE: u32 = 24_000;
const TTS_CHANNELS: u16 = 1;
const TTS_BITS: u16 = 16;

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(15);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);

type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// A Gemini client bound to one API key.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Cheap authenticated call; a key that can list models can generate.
    pub async fn validate(&self) -> ServiceResult<()> {
        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .query(&[("pageSize", "1")])
            .header("x-goog-api-key", &self.api_key)
            .timeout(VALIDATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await);
        }
        Ok(())
    }

    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
    ) -> ServiceResult<String> {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let root = self.generate_content(model, &body).await?;
        response_text(&root)
            .ok_or_else(|| ServiceError::from_message(SERVICE, "response carried no text"))
    }

    /// Narrate `text` and return raw 16-bit mono PCM at 24 kHz.
    pub async fn synthesize(
        &self,
        model: &str,
        voice: &str,
        text: &str,
        style: Option<&str>,
    ) -> ServiceResult<Vec<u8>> {
        let script = truncate_chars(text, TTS_MAX_CHARS);
        let tone = match style.map(str::trim) {
            Some(s) if !s.is_empty() => format!("{s}: "),
            _ => " ".to_string(),
        };
        let body = json!({
            "contents": [{"parts": [{"text": format!("Narra el siguiente guión {tone}:\n\n{script}")}]}],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
                }
            }
        });

        let root = self.generate_content(model, &body).await?;
        let data = response_audio(&root)
            .ok_or_else(|| ServiceError::from_message(SERVICE, "response carried no audio"))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ServiceError::from_message(SERVICE, format!("audio payload: {e}")))
    }

    async fn generate_content(&self, model: &str, body: &Value) -> ServiceResult<Value> {
        let model = model.strip_prefix("models/").unwrap_or(model);
        let resp = self
            .http
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .timeout(GENERATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, format!("response body: {e}")))
    }
}

/// Builds validated [`GeminiClient`]s for the credential pool.
#[derive(Clone)]
pub struct GeminiConnector {
    http: Client,
    base_url: String,
}

impl GeminiConnector {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    type Client = GeminiClient;

    async fn connect(&self, secret: &str) -> ServiceResult<GeminiClient> {
        let client = GeminiClient::new(self.http.clone(), self.base_url.clone(), secret);
        client.validate().await?;
        Ok(client)
    }
}

fn response_text(root: &Value) -> Option<String> {
    let parts = root
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    (!text.is_empty()).then_some(text)
}

fn response_audio(root: &Value) -> Option<&str> {
    root.get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("inlineData")?
        .get("data")?
        .as_str()
}

/// Wrap raw little-endian PCM in a RIFF/WAVE container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * u32::from(block_align);
    let data_len = pcm.len() as u32;

    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

pub async fn write_tts_wav(path: &Path, pcm: &[u8]) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, pcm_to_wav(pcm, TTS_SAMPLE_RATE, TTS_CHANNELS, TTS_BITS)).await?;
    Ok(())
}
