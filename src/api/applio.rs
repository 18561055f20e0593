use crate::api::{failure, session_hash, transport};
use crate::artifact::{Artifact, ArtifactWatcher};
use crate::error::Result;
use crate::{logi, logok};
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE: &str = "applio";

const TTS_FN_INDEX: u32 = 94;
const JOIN_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone)]
pub struct VoiceOptions {
    pub tts_model: String,
    pub voice_path: String,
    pub index_path: String,
    pub speed: i32,
    pub pitch: i32,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            tts_model: "fr-FR-RemyMultilingualNeural".to_string(),
            voice_path: r"logs\VOCES\RemyOriginal.pth".to_string(),
            index_path: r"logs\VOCES\esponja.index".to_string(),
            speed: 0,
            pitch: 0,
        }
    }
}

/// Gradio `queue/join` body for the TTS + RVC tab. `outputs` are the plain
/// TTS path and the converted path, in that order.
pub fn join_payload(
    text: &str,
    voice: &VoiceOptions,
    outputs: (&Path, &Path),
    session: &str,
) -> Value {
    let (tts_output, rvc_output) = outputs;
    json!({
        "data": [
            true,
            "",
            text,
            voice.tts_model,
            voice.speed,
            voice.pitch,
            0.75,
            1,
            0.5,
            "rmvpe",
            tts_output.to_string_lossy(),
            rvc_output.to_string_lossy(),
            voice.voice_path,
            voice.index_path,
            false,
            false,
            1,
            false,
            0.5,
            false,
            0.5,
            "WAV",
            "contentvec",
            null,
            0
        ],
        "event_data": null,
        "fn_index": TTS_FN_INDEX,
        "session_hash": session,
        "trigger_id": rand::thread_rng().gen_range(0..1000)
    })
}

/// Applio only reports completion by rewriting its output files, so every
/// request is a submit followed by an [`ArtifactWatcher`] wait.
#[derive(Clone)]
pub struct ApplioClient {
    http: Client,
    base_url: String,
    session: String,
    rvc_output: PathBuf,
    tts_output: PathBuf,
    watcher: ArtifactWatcher,
}

impl ApplioClient {
    /// `outputs` lists the converted output first, then the plain TTS output.
    pub fn new(http: Client, base_url: impl Into<String>, outputs: Vec<PathBuf>) -> Self {
        let rvc_output = outputs.first().cloned().unwrap_or_default();
        let tts_output = outputs.get(1).cloned().unwrap_or_else(|| rvc_output.clone());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: session_hash(10),
            rvc_output,
            tts_output,
            watcher: ArtifactWatcher::new(SERVICE, outputs),
        }
    }

    pub fn with_watcher(mut self, watcher: ArtifactWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn health_url(&self) -> String {
        format!("{}/", self.base_url)
    }

    pub async fn submit(&self, text: &str, voice: &VoiceOptions) -> Result<Option<String>> {
        let payload = join_payload(
            text,
            voice,
            (&self.tts_output, &self.rvc_output),
            &self.session,
        );
        let resp = self
            .http
            .post(format!("{}/gradio_api/queue/join", self.base_url))
            .json(&payload)
            .timeout(JOIN_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await.into());
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(body
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// Synthesize `text` with the cloned voice and copy the result to `dest`.
    pub async fn narrate(&self, text: &str, voice: &VoiceOptions, dest: &Path) -> Result<Artifact> {
        let preview: String = text.chars().take(100).collect();
        logi(format!("Applio TTS ({}): {}...", voice.voice_path, preview));

        let baseline = self.watcher.baseline().await;
        let event = self.submit(text, voice).await?;
        logi(format!(
            "Applio request accepted (event {})",
            event.as_deref().unwrap_or("?")
        ));

        let artifact = self.watcher.collect(&baseline, dest).await?;
        logok(format!(
            "Applio audio saved: {} ({:.1} KB)",
            dest.display(),
            artifact.size as f64 / 1024.0
        ));
        Ok(artifact)
    }
}
