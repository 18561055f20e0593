use crate::api::{failure, transport};
use crate::error::{Error, Result, ServiceError};
use crate::session::Checkpoint;
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

pub const SERVICE: &str = "comfyui";

const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(5);
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);
const OBJECT_INFO_TIMEOUT: Duration = Duration::from_secs(10);
const SAVE_NODE: &str = "9";

#[derive(Debug, Clone)]
pub struct FluxOptions {
    pub seed: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    pub guidance: f64,
    pub sampler: String,
    pub scheduler: String,
    pub model: String,
    pub negative_prompt: String,
}

impl Default for FluxOptions {
    fn default() -> Self {
        Self {
            seed: None,
            width: 600,
            height: 300,
            steps: 10,
            cfg: 1.0,
            guidance: 3.5,
            sampler: "euler".to_string(),
            scheduler: "simple".to_string(),
            model: "flux1-dev-fp8.safetensors".to_string(),
            negative_prompt: String::new(),
        }
    }
}

/// Flux text-to-image graph in ComfyUI's API format.
pub fn build_flux_workflow(prompt: &str, opts: &FluxOptions) -> Value {
    let seed = opts
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..1_000_000_000_000_000));
    json!({
        "client_id": Uuid::new_v4().to_string(),
        "prompt": {
            "6": {
                "inputs": {"text": prompt, "clip": ["30", 1]},
                "class_type": "CLIPTextEncode"
            },
            "8": {
                "inputs": {"samples": ["31", 0], "vae": ["30", 2]},
                "class_type": "VAEDecode"
            },
            "9": {
                "inputs": {"filename_prefix": "ComfyUI_Generated", "images": ["8", 0]},
                "class_type": "SaveImage"
            },
            "27": {
                "inputs": {"width": opts.width, "height": opts.height, "batch_size": 1},
                "class_type": "EmptySD3LatentImage"
            },
            "30": {
                "inputs": {"ckpt_name": opts.model},
                "class_type": "CheckpointLoaderSimple"
            },
            "31": {
                "inputs": {
                    "seed": seed,
                    "steps": opts.steps,
                    "cfg": opts.cfg,
                    "sampler_name": opts.sampler,
                    "scheduler": opts.scheduler,
                    "denoise": 1,
                    "model": ["30", 0],
                    "positive": ["35", 0],
                    "negative": ["33", 0],
                    "latent_image": ["27", 0]
                },
                "class_type": "KSampler"
            },
            "33": {
                "inputs": {"text": opts.negative_prompt, "clip": ["30", 1]},
                "class_type": "CLIPTextEncode"
            },
            "35": {
                "inputs": {"guidance": opts.guidance, "conditioning": ["6", 0]},
                "class_type": "FluxGuidance"
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub filename: String,
    pub subfolder: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptState {
    Pending,
    Succeeded(Vec<ImageRef>),
    Failed(String),
}

/// Read one prompt's state out of a `/history/{id}` body.
pub fn parse_history(prompt_id: &str, history: &Value) -> PromptState {
    let Some(entry) = history.get(prompt_id) else {
        return PromptState::Pending;
    };
    let Some(status) = entry.get("status") else {
        return PromptState::Pending;
    };

    let status_str = status.get("status_str").and_then(|v| v.as_str());
    let completed = status.get("completed").and_then(|v| v.as_bool()) == Some(true);

    if status_str == Some("error") {
        let messages = status
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|msgs| {
                msgs.iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown error".to_string());
        return PromptState::Failed(messages);
    }

    if status_str == Some("success") || completed {
        let images = entry
            .get("outputs")
            .and_then(|o| o.get(SAVE_NODE))
            .and_then(|n| n.get("images"))
            .and_then(|i| i.as_array())
            .map(|imgs| {
                imgs.iter()
                    .filter_map(|img| {
                        Some(ImageRef {
                            filename: img.get("filename")?.as_str()?.to_string(),
                            subfolder: img
                                .get("subfolder")
                                .and_then(|s| s.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        // finished but outputs not flushed yet
        if images.is_empty() {
            return PromptState::Pending;
        }
        return PromptState::Succeeded(images);
    }

    PromptState::Pending
}

#[derive(Clone)]
pub struct ComfyClient {
    http: Client,
    base_url: String,
    output_roots: Vec<PathBuf>,
    pub submit_timeout: Duration,
    pub poll_interval: Duration,
    pub generation_timeout: Duration,
}

impl ComfyClient {
    pub fn new(http: Client, base_url: impl Into<String>, output_roots: Vec<PathBuf>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            output_roots,
            submit_timeout: SEND_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            generation_timeout: Duration::from_secs(300),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}/system_stats", self.base_url)
    }

    pub async fn submit(&self, workflow: &Value) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .json(workflow)
            .timeout(self.submit_timeout)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await.into());
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, format!("prompt response: {e}")))?;
        body.get("prompt_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::from_message(SERVICE, "prompt response has no prompt_id").into())
    }

    pub async fn poll(&self, prompt_id: &str) -> Result<PromptState> {
        let resp = self
            .http
            .get(format!("{}/history/{}", self.base_url, prompt_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await.into());
        }
        let history: Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, format!("history response: {e}")))?;
        Ok(parse_history(prompt_id, &history))
    }

    /// Ask the server to abandon the prompt it is running. Best effort.
    pub async fn interrupt(&self) {
        let sent = self
            .http
            .post(format!("{}/interrupt", self.base_url))
            .timeout(INTERRUPT_TIMEOUT)
            .send()
            .await;
        if let Err(err) = sent {
            debug!("comfyui interrupt failed: {err}");
        }
    }

    /// Poll history until the prompt finishes or the generation ceiling passes.
    /// Failed polls are tolerated; the server is often busy mid-generation.
    /// `checkpoint` is consulted on every tick and interrupts the server when
    /// the session was cancelled.
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        started: Instant,
        checkpoint: Checkpoint<'_>,
    ) -> Result<Vec<ImageRef>> {
        let mut attempts: u32 = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if let Err(err) = checkpoint.check() {
                debug!(prompt_id, "session cancelled, interrupting comfyui");
                self.interrupt().await;
                return Err(err);
            }
            match self.poll(prompt_id).await {
                Ok(PromptState::Succeeded(images)) => return Ok(images),
                Ok(PromptState::Failed(message)) => {
                    return Err(Error::GenerationFailed {
                        service: SERVICE.to_string(),
                        message,
                    });
                }
                Ok(PromptState::Pending) => {}
                Err(err) => {
                    if attempts % 10 == 0 {
                        debug!(prompt_id, attempts, "history poll failed: {err}");
                    }
                }
            }
            attempts += 1;
            if started.elapsed() >= self.generation_timeout {
                return Err(Error::GenerationTimeout {
                    service: SERVICE.to_string(),
                    elapsed: started.elapsed(),
                });
            }
        }
    }

    /// Submit, wait, and copy the first output image into `dest_dir`.
    pub async fn generate(
        &self,
        prompt: &str,
        opts: &FluxOptions,
        dest_dir: &Path,
        checkpoint: Checkpoint<'_>,
    ) -> Result<PathBuf> {
        let started = Instant::now();
        let workflow = build_flux_workflow(prompt, opts);
        let prompt_id = match self.submit(&workflow).await {
            Ok(id) => id,
            // a hung submit means the server is wedged, same as a slow generation
            Err(Error::Service(e)) if e.is_timeout() => {
                return Err(Error::GenerationTimeout {
                    service: SERVICE.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            Err(err) => return Err(err),
        };
        debug!(prompt_id, steps = opts.steps, "comfyui prompt queued");

        let images = self.wait_for_completion(&prompt_id, started, checkpoint).await?;
        let first = images.first().ok_or_else(|| Error::GenerationFailed {
            service: SERVICE.to_string(),
            message: "no images in output".to_string(),
        })?;
        self.copy_output(first, dest_dir).await
    }

    pub async fn copy_output(&self, image: &ImageRef, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.locate_output(image).ok_or_else(|| Error::GenerationFailed {
            service: SERVICE.to_string(),
            message: format!("generated image not found: {}", image.filename),
        })?;
        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&image.filename);
        fs::copy(&source, &dest).await?;
        Ok(dest)
    }

    fn locate_output(&self, image: &ImageRef) -> Option<PathBuf> {
        for root in &self.output_roots {
            let direct = root.join(&image.subfolder).join(&image.filename);
            if direct.is_file() {
                return Some(direct);
            }
        }
        self.output_roots.iter().find_map(|root| {
            WalkDir::new(root)
                .max_depth(3)
                .into_iter()
                .filter_map(|e| e.ok())
                .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == image.filename)
                .map(|e| e.into_path())
        })
    }

    /// Checkpoint names the running server can load.
    pub async fn available_models(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(format!("{}/object_info", self.base_url))
            .timeout(OBJECT_INFO_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(SERVICE, e))?;
        if !resp.status().is_success() {
            return Err(failure(SERVICE, resp).await.into());
        }
        let info: Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::transport(SERVICE, format!("object_info response: {e}")))?;
        Ok(checkpoint_names(&info))
    }
}

fn checkpoint_names(info: &Value) -> Vec<String> {
    info.pointer("/CheckpointLoaderSimple/input/required/ckpt_name/0")
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionController;
    use httpmock::prelude::*;

    #[test]
    fn workflow_carries_options() {
        let opts = FluxOptions {
            seed: Some(42),
            steps: 25,
            width: 1280,
            height: 720,
            ..FluxOptions::default()
        };
        let wf = build_flux_workflow("a castle at dusk", &opts);
        assert_eq!(wf["prompt"]["6"]["inputs"]["text"], "a castle at dusk");
        assert_eq!(wf["prompt"]["31"]["inputs"]["seed"], 42);
        assert_eq!(wf["prompt"]["31"]["inputs"]["steps"], 25);
        assert_eq!(wf["prompt"]["27"]["inputs"]["width"], 1280);
        assert_eq!(wf["prompt"]["35"]["inputs"]["guidance"], 3.5);
        assert!(wf["client_id"].as_str().is_some());
    }

    #[test]
    fn history_states() {
        assert_eq!(parse_history("p1", &json!({})), PromptState::Pending);

        let done = json!({
            "p1": {
                "status": {"status_str": "success", "completed": true},
                "outputs": {"9": {"images": [{"filename": "ComfyUI_Generated_00001_.png", "subfolder": "", "type": "output"}]}}
            }
        });
        assert_eq!(
            parse_history("p1", &done),
            PromptState::Succeeded(vec![ImageRef {
                filename: "ComfyUI_Generated_00001_.png".into(),
                subfolder: String::new(),
            }])
        );

        let failed = json!({"p1": {"status": {"status_str": "error", "messages": ["oom"]}}});
        assert!(matches!(parse_history("p1", &failed), PromptState::Failed(m) if m.contains("oom")));
    }

    #[test]
    fn reads_checkpoint_list() {
        let info = json!({
            "CheckpointLoaderSimple": {"input": {"required": {"ckpt_name": [["flux1-dev-fp8.safetensors", "sdxl.safetensors"]]}}}
        });
        assert_eq!(checkpoint_names(&info), vec!["flux1-dev-fp8.safetensors", "sdxl.safetensors"]);
        assert!(checkpoint_names(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn copies_output_from_subfolder() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let sub = root.path().join("batch");
        fs::create_dir_all(&sub).await.unwrap();
        fs::write(sub.join("img.png"), b"png").await.unwrap();

        let client = ComfyClient::new(Client::new(), "http://127.0.0.1:8188", vec![root.path().to_path_buf()]);
        let image = ImageRef {
            filename: "img.png".into(),
            subfolder: String::new(),
        };
        let copied = client.copy_output(&image, dest.path()).await.unwrap();
        assert_eq!(copied, dest.path().join("img.png"));
        assert_eq!(fs::read(&copied).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn cancellation_stops_polling_mid_generation() {
        let server = MockServer::start_async().await;
        let submit = server
            .mock_async(|when, then| {
                when.method(POST).path("/prompt");
                then.status(200).json_body(json!({"prompt_id": "p1"}));
            })
            .await;
        let history = server
            .mock_async(|when, then| {
                when.method(GET).path("/history/p1");
                then.status(200).json_body(json!({}));
            })
            .await;
        let interrupt = server
            .mock_async(|when, then| {
                when.method(POST).path("/interrupt");
                then.status(200);
            })
            .await;

        let mut client = ComfyClient::new(Client::new(), server.base_url(), Vec::new());
        client.poll_interval = Duration::from_millis(20);
        let sessions = SessionController::new();
        let id = sessions.start();
        let dest = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let options = FluxOptions::default();

        let (result, cancelled) = tokio::join!(
            client.generate("a fox", &options, dest.path(), sessions.checkpoint(&id)),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                sessions.request_cancel()
            }
        );

        assert!(cancelled);
        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        submit.assert_async().await;
        assert!(history.hits_async().await >= 1);
        interrupt.assert_async().await;
    }

    #[tokio::test]
    async fn hung_submit_counts_as_generation_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/prompt");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({"prompt_id": "late"}));
            })
            .await;

        let mut client = ComfyClient::new(Client::new(), server.base_url(), Vec::new());
        client.submit_timeout = Duration::from_millis(50);
        let dest = tempfile::tempdir().unwrap();

        let err = client
            .generate("a fox", &FluxOptions::default(), dest.path(), Checkpoint::none())
            .await
            .unwrap_err();
        assert!(err.is_generation_timeout());
    }
}
