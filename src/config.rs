use crate::api::gemini;
use crate::credentials::{Credential, DEFAULT_BREAKER_THRESHOLD};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(rename = "openai_api_key")]
    #[serde(default)]
    pub openai_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_attempts")]
    pub llm_max_attempts: u32,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub comfyui: ComfyConfig,
    #[serde(default)]
    pub applio: ApplioConfig,
    #[serde(default)]
    pub fooocus: FooocusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(rename = "api_key")]
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(rename = "free_api_keys")]
    #[serde(default)]
    pub free_keys: Vec<String>,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_google_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyConfig {
    #[serde(default = "default_comfy_url")]
    pub url: String,
    #[serde(default = "default_comfy_script")]
    pub launch_script: PathBuf,
    #[serde(default = "default_comfy_outputs")]
    pub output_dirs: Vec<PathBuf>,
    #[serde(default = "default_kill_images")]
    pub kill_images: Vec<String>,
    #[serde(default = "default_comfy_title")]
    pub window_title: String,
    #[serde(default = "default_startup_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_generation_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_pause_secs")]
    pub restart_pause_secs: u64,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplioConfig {
    #[serde(default = "default_applio_url")]
    pub url: String,
    #[serde(default = "default_applio_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub launch_script: Option<PathBuf>,
    #[serde(default = "default_applio_title")]
    pub window_title: String,
    #[serde(default = "default_kill_images")]
    pub kill_images: Vec<String>,
    #[serde(default = "default_applio_model")]
    pub tts_model: String,
    #[serde(default = "default_applio_voice")]
    pub voice_path: String,
    #[serde(default = "default_applio_index")]
    pub index_path: String,
    #[serde(default)]
    pub pitch: i32,
    #[serde(default)]
    pub speed: i32,
    #[serde(default = "default_startup_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FooocusConfig {
    #[serde(default = "default_fooocus_url")]
    pub url: String,
    #[serde(default = "default_fooocus_performance")]
    pub performance: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_llm_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_llm_attempts() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    DEFAULT_BREAKER_THRESHOLD
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("public/outputs")
}

fn default_tts_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

fn default_tts_voice() -> String {
    "Orus".to_string()
}

fn default_google_base_url() -> String {
    gemini::BASE_URL.to_string()
}

fn default_comfy_url() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_comfy_script() -> PathBuf {
    PathBuf::from(r"C:\comfy\ComfyUI\run_nvidia_gpu.bat")
}

fn default_comfy_outputs() -> Vec<PathBuf> {
    vec![
        PathBuf::from(r"C:\comfy\ComfyUI\output"),
        PathBuf::from(r"C:\ComfyUI\output"),
        PathBuf::from("ComfyUI/output"),
    ]
}

fn default_kill_images() -> Vec<String> {
    vec!["python.exe".to_string()]
}

fn default_comfy_title() -> String {
    "ComfyUI".to_string()
}

fn default_startup_secs() -> u64 {
    120
}

fn default_generation_secs() -> u64 {
    300
}

fn default_max_restarts() -> u32 {
    2
}

fn default_restart_pause_secs() -> u64 {
    5
}

fn default_settle_secs() -> u64 {
    3
}

fn default_applio_url() -> String {
    "http://127.0.0.1:6969".to_string()
}

fn default_applio_root() -> PathBuf {
    PathBuf::from(r"C:\applio2\Applio")
}

fn default_applio_title() -> String {
    "Applio".to_string()
}

fn default_applio_model() -> String {
    "fr-FR-RemyMultilingualNeural".to_string()
}

fn default_applio_voice() -> String {
    r"logs\VOCES\RemyOriginal.pth".to_string()
}

fn default_applio_index() -> String {
    r"logs\VOCES\esponja.index".to_string()
}

fn default_fooocus_url() -> String {
    "ws://127.0.0.1:7865".to_string()
}

fn default_fooocus_performance() -> String {
    "Extreme Speed".to_string()
}

impl Default for GoogleConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl Default for ComfyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl Default for ApplioConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl Default for FooocusConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let mut config = Self::from_json(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("config.json: invalid JSON")
    }

    /// Fill secrets and paths the file leaves out from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.google.primary_key.is_none() {
            self.google.primary_key = lookup("GOOGLE_API_KEY");
        }
        if self.google.free_keys.is_empty() {
            let first = lookup("GOOGLE_API_KEY_GRATIS").or_else(|| lookup("GOOGLE_API_KEY_GRATIS1"));
            self.google.free_keys.extend(first);
            for n in 2..=9 {
                if let Some(key) = lookup(&format!("GOOGLE_API_KEY_GRATIS{n}")) {
                    self.google.free_keys.push(key);
                }
            }
        }
        if self.openai_key.is_none() {
            self.openai_key = lookup("OPENAI_API_KEY");
        }
        if let Some(root) = lookup("APPLIO_ROOT") {
            self.applio.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let has_google = self.google.primary_key.as_deref().is_some_and(|k| !k.is_empty())
            || self.google.free_keys.iter().any(|k| !k.is_empty());
        if !has_google {
            anyhow::bail!("config.json: google.api_key or google.free_api_keys missing");
        }
        if self.circuit_breaker_threshold == 0 {
            anyhow::bail!("config.json: circuit_breaker_threshold must be at least 1");
        }
        Ok(())
    }

    /// Google credentials in rotation order: free keys, then the primary.
    pub fn google_credentials(&self) -> Vec<Credential> {
        let mut entries: Vec<Credential> = self
            .google
            .free_keys
            .iter()
            .enumerate()
            .map(|(i, key)| Credential::free(format!("GRATIS{}", i + 1), Some(key.clone())))
            .collect();
        entries.push(Credential::primary("PRINCIPAL", self.google.primary_key.clone()));
        entries
    }

    pub fn applio_launch_script(&self) -> PathBuf {
        self.applio
            .launch_script
            .clone()
            .unwrap_or_else(|| self.applio.root.join("run-applio.bat"))
    }

    pub fn applio_output_paths(&self) -> Vec<PathBuf> {
        let audios = self.applio.root.join("assets").join("audios");
        vec![audios.join("tts_rvc_output.wav"), audios.join("tts_output.wav")]
    }
}
