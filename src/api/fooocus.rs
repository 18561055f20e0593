use crate::api::session_hash;
use crate::error::{Error, Result};
use crate::logi;
use crate::session::Checkpoint;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;
use walkdir::WalkDir;

pub const SERVICE: &str = "fooocus";

const FN_TASK_ID: u32 = 66;
const FN_CONFIGURE: u32 = 67;
const FN_EXECUTE: u32 = 68;
const STEP_GAP: Duration = Duration::from_millis(100);

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"value="(\d+)""#).expect("progress pattern"));

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub mode: &'static str,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: &'static str,
    pub scheduler: &'static str,
}

const fn preset_of(mode: &'static str, steps: u32, cfg_scale: f64) -> Preset {
    Preset {
        mode,
        steps,
        cfg_scale,
        sampler: "dpmpp_2m_sde_gpu",
        scheduler: "karras",
    }
}

pub const PRESETS: [Preset; 5] = [
    preset_of("Quality", 30, 7.0),
    preset_of("Speed", 15, 4.0),
    preset_of("Extreme Speed", 2, 4.0),
    preset_of("Lightning", 2, 1.0),
    preset_of("Hyper-SD", 1, 1.0),
];

/// Look up a performance preset by name, falling back to Extreme Speed.
pub fn preset(name: &str) -> Preset {
    PRESETS
        .iter()
        .find(|p| p.mode.eq_ignore_ascii_case(name))
        .copied()
        .unwrap_or(PRESETS[2])
}

/// Positional arguments for the configure step. Fooocus binds these by
/// index; the `null` slots at 2, 5, 9, 11, 12, 48 and 49 are filled per call.
const PARAMS_TEMPLATE: &str = r#"[
    null, false, null, "",
    ["Fooocus V2", "Fooocus Enhance", "Fooocus Sharp"],
    null,
    "1344×768 <span style=\"color: grey;\"> ∣ 16:9</span>",
    1, "png", null, false, null, null,
    "juggernautXL_v8Rundiffusion.safetensors", "None", 0.5, true,
    "sd_xl_offset_example-lora_1.0.safetensors", 0.1, true, "None", 1, true,
    "None", 1, true, "None", 1, true, "None", 1, false, "uov", "Disabled",
    null, [], null, "", null, false, true, false, false, 1.5, 0.8, 0.3, 7, 2,
    null, null, "Default (model)", -1, -1, -1, -1, -1, -1,
    false, false, false, false, 64, 128, "joint", 0.25, false, 1.01, 1.02,
    0.99, 0.95, false, false, "v2.6", 1, 0.618, false, false, 0, false, false,
    "fooocus", null, 0.5, 0.6, "ImagePrompt", null, 0.5, 0.6, "ImagePrompt",
    null, 0.5, 0.6, "ImagePrompt", null, 0.5, 0.6, "ImagePrompt", false, 0,
    false, null, false, "Disabled", "Before First Enhancement", "Original Prompts",
    false, "", "", "", "sam", "full", "vit_b", 0.25, 0.3, 0, false, "v2.6",
    1, 0.618, 0, false, false, "", "", "", "sam", "full", "vit_b", 0.25, 0.3,
    0, false, "v2.6", 1, 0.618, 0, false, false, "", "", "", "sam", "full",
    "vit_b", 0.25, 0.3, 0, false, "v2.6", 1, 0.618, 0, false
]"#;

static PARAMS: Lazy<Value> =
    Lazy::new(|| serde_json::from_str(PARAMS_TEMPLATE).expect("fooocus params template"));

fn generation_params(prompt: &str, task_id: &Value, p: &Preset) -> Value {
    let mut params = PARAMS.clone();
    if let Some(slots) = params.as_array_mut() {
        slots[2] = json!(prompt);
        slots[5] = json!(p.mode);
        slots[9] = task_id.clone();
        slots[11] = json!(p.steps);
        slots[12] = json!(p.cfg_scale);
        slots[48] = json!(p.sampler);
        slots[49] = json!(p.scheduler);
    }
    params
}

fn progress_percent(message: &Value) -> Option<u32> {
    let html = message.pointer("/output/data/0/value")?.as_str()?;
    if !html.contains("progress") {
        return None;
    }
    PROGRESS_RE.captures(html)?.get(1)?.as_str().parse().ok()
}

/// `.png` names listed in a completed step's output, in order.
pub fn output_images(output: &Value) -> Vec<String> {
    let Some(items) = output.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.get("value").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|file| file.get("name").and_then(|n| n.as_str()))
        .filter(|name| name.ends_with(".png"))
        .map(str::to_string)
        .collect()
}

/// Drives Fooocus's Gradio queue: fetch a task id, configure, execute.
/// Each step is its own `/queue/join` socket.
#[derive(Debug, Clone)]
pub struct FooocusClient {
    base_url: String,
    temp_dir: PathBuf,
    pub step_timeout: Duration,
}

impl FooocusClient {
    /// `base_url` is the websocket root, e.g. `ws://127.0.0.1:7865`.
    pub fn new(base_url: impl Into<String>, temp_dir: Option<PathBuf>) -> Self {
        let temp_dir = temp_dir.unwrap_or_else(|| std::env::temp_dir().join("fooocus"));
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            temp_dir,
            step_timeout: Duration::from_secs(300),
        }
    }

    pub fn health_url(&self) -> String {
        self.http_origin() + "/"
    }

    fn http_origin(&self) -> String {
        if let Some(rest) = self.base_url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            self.base_url.clone()
        }
    }

    /// Run the three-step handshake and copy the resulting image into `dest_dir`.
    /// `checkpoint` is checked before every step.
    pub async fn generate(
        &self,
        prompt: &str,
        performance: &str,
        dest_dir: &Path,
        checkpoint: Checkpoint<'_>,
    ) -> Result<PathBuf> {
        let started = Instant::now();
        let session = session_hash(13);
        let p = preset(performance);
        logi(format!(
            "Fooocus {} ({} steps, CFG {})",
            p.mode, p.steps, p.cfg_scale
        ));

        checkpoint.check()?;
        let first = self.run_step(FN_TASK_ID, &session, json!([true, "0"]), started).await?;
        let task_id = first.pointer("/data/0").cloned().unwrap_or(Value::Null);
        debug!(%task_id, "fooocus task id");
        tokio::time::sleep(STEP_GAP).await;

        checkpoint.check()?;
        let params = generation_params(prompt, &task_id, &p);
        self.run_step(FN_CONFIGURE, &session, params, started).await?;
        tokio::time::sleep(STEP_GAP).await;

        checkpoint.check()?;
        let output = self.run_step(FN_EXECUTE, &session, json!([null]), started).await?;
        let name = output_images(&output).pop().ok_or_else(|| Error::GenerationFailed {
            service: SERVICE.to_string(),
            message: "no image in output".to_string(),
        })?;

        let source = self.locate(&name).await.ok_or_else(|| Error::GenerationFailed {
            service: SERVICE.to_string(),
            message: format!("generated image not found: {name}"),
        })?;
        fs::create_dir_all(dest_dir).await?;
        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "fooocus.png".into());
        let dest = dest_dir.join(file_name);
        fs::copy(&source, &dest).await?;
        Ok(dest)
    }

    async fn run_step(&self, fn_index: u32, session: &str, data: Value, started: Instant) -> Result<Value> {
        match tokio::time::timeout(self.step_timeout, self.step(fn_index, session, data)).await {
            Ok(result) => result,
            Err(_) => Err(Error::GenerationTimeout {
                service: SERVICE.to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }

    async fn step(&self, fn_index: u32, session: &str, data: Value) -> Result<Value> {
        let mut request = format!("{}/queue/join", self.base_url)
            .into_client_request()
            .map_err(|e| self.failed(fn_index, e))?;
        if let Ok(origin) = HeaderValue::from_str(&self.http_origin()) {
            request.headers_mut().insert("Origin", origin);
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| self.failed(fn_index, e))?;
        let (mut sink, mut stream) = ws.split();

        let hello = json!({"fn_index": fn_index, "session_hash": session});
        sink.send(Message::Text(hello.to_string()))
            .await
            .map_err(|e| self.failed(fn_index, e))?;

        while let Some(frame) = stream.next().await {
            let text = match frame.map_err(|e| self.failed(fn_index, e))? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let message: Value = serde_json::from_str(&text)?;
            match message.get("msg").and_then(|m| m.as_str()) {
                Some("send_data") => {
                    let payload = json!({
                        "data": data,
                        "event_data": null,
                        "fn_index": fn_index,
                        "session_hash": session,
                    });
                    sink.send(Message::Text(payload.to_string()))
                        .await
                        .map_err(|e| self.failed(fn_index, e))?;
                }
                Some("process_generating") => {
                    if let Some(pct) = progress_percent(&message) {
                        debug!(pct, "fooocus progress");
                    }
                }
                Some("process_completed") => {
                    if message.get("success").and_then(|s| s.as_bool()) == Some(false) {
                        return Err(self.failed(fn_index, "step reported failure"));
                    }
                    let _ = sink.close().await;
                    return Ok(message.get("output").cloned().unwrap_or(Value::Null));
                }
                other => debug!(fn_index, msg = ?other, "fooocus message"),
            }
        }

        Err(self.failed(fn_index, "socket closed before completion"))
    }

    fn failed(&self, fn_index: u32, err: impl std::fmt::Display) -> Error {
        Error::GenerationFailed {
            service: SERVICE.to_string(),
            message: format!("step {fn_index}: {err}"),
        }
    }

    /// Find the newest file called `name` (or its basename) under the temp dir.
    async fn locate(&self, name: &str) -> Option<PathBuf> {
        let direct = PathBuf::from(name);
        if fs::metadata(&direct).await.map(|m| m.is_file()).unwrap_or(false) {
            return Some(direct);
        }
        let base = Path::new(&name.replace('\\', "/"))
            .file_name()?
            .to_string_lossy()
            .into_owned();
        let root = self.temp_dir.clone();
        tokio::task::spawn_blocking(move || {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == base)
                .max_by_key(|e| {
                    e.metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(SystemTime::UNIX_EPOCH)
                })
                .map(|e| e.into_path())
        })
        .await
        .ok()
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionController;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// Minimal Gradio queue: every connection completes one step. The
    /// session is cancelled while the first step is still in flight.
    async fn cancelling_server(sessions: Arc<SessionController>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&served);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                ws.next().await;
                ws.send(Message::Text(json!({"msg": "send_data"}).to_string()))
                    .await
                    .unwrap();
                ws.next().await;
                count.fetch_add(1, Ordering::SeqCst);
                sessions.request_cancel();
                let done = json!({"msg": "process_completed", "success": true, "output": {"data": ["task-1"]}});
                ws.send(Message::Text(done.to_string())).await.unwrap();
            }
        });
        (format!("ws://{addr}"), served)
    }

    #[tokio::test]
    async fn cancelled_session_stops_between_steps() {
        let sessions = Arc::new(SessionController::new());
        let id = sessions.start();
        let (url, served) = cancelling_server(Arc::clone(&sessions)).await;
        let tmp = tempfile::tempdir().unwrap();
        let client = FooocusClient::new(url, Some(tmp.path().to_path_buf()));

        let err = client
            .generate("a red fox", "Speed", tmp.path(), sessions.checkpoint(&id))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_session_never_connects() {
        let sessions = SessionController::new();
        let id = sessions.start();
        sessions.request_cancel();
        let tmp = tempfile::tempdir().unwrap();
        let client = FooocusClient::new("ws://127.0.0.1:9", Some(tmp.path().to_path_buf()));

        let err = client
            .generate("a red fox", "Speed", tmp.path(), sessions.checkpoint(&id))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn presets_by_name() {
        assert_eq!(preset("Quality").steps, 30);
        assert_eq!(preset("hyper-sd").steps, 1);
        assert_eq!(preset("unknown").mode, "Extreme Speed");
    }

    #[test]
    fn params_carry_prompt_and_preset() {
        let p = preset("Speed");
        let params = generation_params("a red fox", &json!("task-1"), &p);
        let arr = params.as_array().unwrap();
        assert_eq!(arr.len(), 153);
        assert_eq!(arr[2], "a red fox");
        assert_eq!(arr[5], "Speed");
        assert_eq!(arr[9], "task-1");
        assert_eq!(arr[11], 15);
        assert_eq!(arr[12], 4.0);
        assert_eq!(arr[48], "dpmpp_2m_sde_gpu");
        assert_eq!(arr[49], "karras");
    }

    #[test]
    fn parses_progress_html() {
        let msg = json!({
            "msg": "process_generating",
            "output": {"data": [{"value": "<div class=\"progress\"><progress value=\"42\" max=\"100\"></progress></div>"}]}
        });
        assert_eq!(progress_percent(&msg), Some(42));
        assert_eq!(progress_percent(&json!({"output": {"data": [{"value": "idle"}]}})), None);
    }

    #[test]
    fn lists_png_outputs() {
        let output = json!({
            "data": [
                {"value": null},
                {"value": [{"name": "C:\\Temp\\fooocus\\2025\\a.png"}, {"name": "log.html"}]}
            ]
        });
        assert_eq!(output_images(&output), vec!["C:\\Temp\\fooocus\\2025\\a.png"]);
    }

    #[tokio::test]
    async fn locates_image_under_temp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("2025-01-01");
        fs::create_dir_all(&nested).await.unwrap();
        fs::write(nested.join("image_1.png"), b"png").await.unwrap();

        let client = FooocusClient::new("ws://127.0.0.1:7865", Some(tmp.path().to_path_buf()));
        let found = client.locate(r"C:\Users\x\AppData\Local\Temp\fooocus\image_1.png").await;
        assert_eq!(found, Some(nested.join("image_1.png")));
        assert_eq!(client.health_url(), "http://127.0.0.1:7865/");
    }
}
