use crate::api::applio::{ApplioClient, VoiceOptions};
use crate::api::comfyui::{ComfyClient, FluxOptions};
use crate::api::fooocus::FooocusClient;
use crate::api::gemini::{self, GeminiConnector};
use crate::api::openai::OpenAiClient;
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::error::{Error, Result};
use crate::platform::SystemProcessControl;
use crate::queue::{OrderedTaskQueue, QueueStatus, TaskHandle};
use crate::retry::{RetryPolicy, call_with_retry};
use crate::session::{SessionController, SessionId};
use crate::supervisor::{
    GpuGate, HealthProbe, HttpHealthProbe, ProcessControl, ProcessSupervisor, RestartPolicy,
    ServiceSpec,
};
use crate::{logi, logok};
use clap::ValueEnum;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VoiceBackend {
    Applio,
    Google,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImageBackend {
    #[value(name = "comfyui")]
    ComfyUi,
    Fooocus,
    None,
}

/// Models whose name mentions gpt are served by OpenAI; everything else by Gemini.
pub fn is_openai_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("gpt") || model.contains("openai")
}

pub struct Coordinator {
    config: Config,
    gemini: GeminiConnector,
    openai: Option<OpenAiClient>,
    llm_keys: CredentialPool,
    tts_keys: CredentialPool,
    applio_queue: OrderedTaskQueue<PathBuf>,
    google_queue: OrderedTaskQueue<PathBuf>,
    comfyui: Arc<ProcessSupervisor>,
    applio: Arc<ProcessSupervisor>,
    comfy_client: ComfyClient,
    applio_client: ApplioClient,
    fooocus_client: FooocusClient,
    sessions: SessionController,
    restart_policy: RestartPolicy,
}

impl Coordinator {
    pub fn new(config: Config, http: Client) -> Arc<Self> {
        let control: Arc<dyn ProcessControl> = Arc::new(SystemProcessControl);

        let mut comfy_client = ComfyClient::new(
            http.clone(),
            config.comfyui.url.clone(),
            config.comfyui.output_dirs.clone(),
        );
        comfy_client.generation_timeout = Duration::from_secs(config.comfyui.generation_timeout_secs);

        let applio_client = ApplioClient::new(
            http.clone(),
            config.applio.url.clone(),
            config.applio_output_paths(),
        );

        let comfy_probe: Arc<dyn HealthProbe> =
            Arc::new(HttpHealthProbe::new(http.clone(), comfy_client.health_url()));
        let applio_probe: Arc<dyn HealthProbe> =
            Arc::new(HttpHealthProbe::new(http.clone(), applio_client.health_url()));

        Self::with_services(config, http, comfy_client, applio_client, comfy_probe, applio_probe, control)
    }

    /// Assemble a coordinator around explicit clients, probes and process
    /// control.
    pub fn with_services(
        config: Config,
        http: Client,
        comfy_client: ComfyClient,
        applio_client: ApplioClient,
        comfy_probe: Arc<dyn HealthProbe>,
        applio_probe: Arc<dyn HealthProbe>,
        control: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        let gate = GpuGate::default();

        let mut comfy_spec = ServiceSpec::new("ComfyUI", config.comfyui.launch_script.clone());
        comfy_spec.kill_images = config.comfyui.kill_images.clone();
        comfy_spec.window_title = config.comfyui.window_title.clone();
        comfy_spec.startup_attempts = config.comfyui.startup_timeout_secs as u32;
        comfy_spec.settle_delay = Duration::from_secs(config.comfyui.settle_secs);

        let mut applio_spec = ServiceSpec::new("Applio", config.applio_launch_script());
        applio_spec.working_dir = Some(config.applio.root.clone());
        applio_spec.kill_images = config.applio.kill_images.clone();
        applio_spec.window_title = config.applio.window_title.clone();
        applio_spec.startup_attempts = config.applio.startup_timeout_secs as u32;
        applio_spec.settle_delay = Duration::from_secs(config.applio.settle_secs);

        let comfyui = Arc::new(ProcessSupervisor::new(
            comfy_spec,
            comfy_probe,
            Arc::clone(&control),
            gate.clone(),
        ));
        let applio = Arc::new(ProcessSupervisor::new(applio_spec, applio_probe, control, gate));
        ProcessSupervisor::mutually_exclusive(&comfyui, &applio);

        let threshold = config.circuit_breaker_threshold;
        let llm_keys = CredentialPool::new("llm", config.google_credentials(), threshold);
        let tts_keys = CredentialPool::new("tts", config.google_credentials(), threshold);

        let openai = config
            .openai_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| OpenAiClient::new(http.clone(), k));

        let fooocus_client =
            FooocusClient::new(config.fooocus.url.clone(), config.fooocus.output_dir.clone());

        let restart_policy = RestartPolicy {
            max_restarts: config.comfyui.max_restarts,
            pause: Duration::from_secs(config.comfyui.restart_pause_secs),
        };

        Arc::new(Self {
            gemini: GeminiConnector::with_base_url(http, config.google.base_url.clone()),
            openai,
            llm_keys,
            tts_keys,
            applio_queue: OrderedTaskQueue::new("applio"),
            google_queue: OrderedTaskQueue::new("google-tts"),
            comfyui,
            applio,
            comfy_client,
            applio_client,
            fooocus_client,
            sessions: SessionController::new(),
            restart_policy,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn llm_keys(&self) -> &CredentialPool {
        &self.llm_keys
    }

    pub fn tts_keys(&self) -> &CredentialPool {
        &self.tts_keys
    }

    pub fn comfyui(&self) -> &Arc<ProcessSupervisor> {
        &self.comfyui
    }

    pub fn applio(&self) -> &Arc<ProcessSupervisor> {
        &self.applio
    }

    pub fn queue_status(&self, backend: VoiceBackend) -> QueueStatus {
        match backend {
            VoiceBackend::Applio => self.applio_queue.status(),
            VoiceBackend::Google => self.google_queue.status(),
        }
    }

    /// Generate text with retry on transient overload. Gemini calls go
    /// through key rotation; a tripped breaker surfaces as a fatal error.
    pub async fn generate_text(&self, model: &str, prompt: &str, system: Option<&str>) -> Result<String> {
        if is_openai_model(model) {
            let client = self.openai.as_ref().ok_or_else(|| Error::NoCredentials {
                context: "openai".to_string(),
            })?;
            let policy = RetryPolicy::default().with_max_attempts(self.config.llm_max_attempts);
            return call_with_retry(policy, move || async move {
                client.chat(model, prompt, system).await.map_err(Error::from)
            })
            .await;
        }

        let policy = RetryPolicy::for_tier(self.llm_keys.current_tier())
            .with_max_attempts(self.config.llm_max_attempts);
        let (pool, connector) = (&self.llm_keys, &self.gemini);
        call_with_retry(policy, move || {
            pool.execute(connector, false, move |client| {
                let model = model.to_string();
                let prompt = prompt.to_string();
                let system = system.map(str::to_string);
                async move { client.generate(&model, &prompt, system.as_deref()).await }
            })
        })
        .await
    }

    pub fn start_image_session(&self) -> SessionId {
        self.sessions.start()
    }

    pub fn finish_image_session(&self, session: &str) {
        self.sessions.finish(session)
    }

    /// Ask the running image session to stop at its next step boundary.
    pub fn cancel_images(&self) -> bool {
        self.sessions.request_cancel()
    }

    /// Generate one image into `dest_dir`. Returns `None` when images are
    /// disabled. The session is checked around the job and at every step
    /// inside it; ComfyUI holds the GPU lease until the image is copied.
    pub async fn generate_image(
        &self,
        backend: ImageBackend,
        session: &str,
        prompt: &str,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let checkpoint = self.sessions.checkpoint(session);
        checkpoint.check()?;
        let path = match backend {
            ImageBackend::None => return Ok(None),
            ImageBackend::ComfyUi => {
                let _lease = self.comfyui.acquire_for_use().await?;
                checkpoint.check()?;
                let opts = FluxOptions::default();
                let (client, opts) = (&self.comfy_client, &opts);
                self.comfyui
                    .run_with_restart(self.restart_policy, move || {
                        client.generate(prompt, opts, dest_dir, checkpoint)
                    })
                    .await?
            }
            ImageBackend::Fooocus => {
                self.fooocus_client
                    .generate(prompt, &self.config.fooocus.performance, dest_dir, checkpoint)
                    .await?
            }
        };
        self.sessions.check_cancelled(session)?;
        Ok(Some(path))
    }

    /// Queue narration on the Applio backend. The task holds the GPU lease
    /// for Applio, stopping ComfyUI once no image job is using it.
    pub fn narrate_applio(
        self: &Arc<Self>,
        run_id: &str,
        order: u64,
        text: String,
        dest: PathBuf,
    ) -> Result<TaskHandle<PathBuf>> {
        let this = Arc::clone(self);
        let voice = VoiceOptions {
            tts_model: self.config.applio.tts_model.clone(),
            voice_path: self.config.applio.voice_path.clone(),
            index_path: self.config.applio.index_path.clone(),
            speed: self.config.applio.speed,
            pitch: self.config.applio.pitch,
        };
        self.applio_queue
            .enqueue(run_id, order, format!("applio #{order}"), move || async move {
                let _lease = this.applio.acquire_for_use().await?;
                this.applio_client.narrate(&text, &voice, &dest).await?;
                Ok(dest)
            })
    }

    /// Queue narration on Gemini TTS, rotating keys under the `tts` context.
    pub fn narrate_google(
        self: &Arc<Self>,
        run_id: &str,
        order: u64,
        text: String,
        dest: PathBuf,
        style: Option<String>,
    ) -> Result<TaskHandle<PathBuf>> {
        let this = Arc::clone(self);
        self.google_queue
            .enqueue(run_id, order, format!("google-tts #{order}"), move || async move {
                let model = this.config.google.tts_model.clone();
                let voice = this.config.google.tts_voice.clone();
                let policy = RetryPolicy::for_tier(this.tts_keys.current_tier());
                let (pool, connector) = (&this.tts_keys, &this.gemini);
                let (model, voice, script, style) = (&model, &voice, &text, &style);
                let pcm = call_with_retry(policy, move || {
                    pool.execute(connector, false, move |client| {
                        let (model, voice, script, style) =
                            (model.clone(), voice.clone(), script.clone(), style.clone());
                        async move { client.synthesize(&model, &voice, &script, style.as_deref()).await }
                    })
                })
                .await?;
                gemini::write_tts_wav(&dest, &pcm).await?;
                logok(format!("Narration saved: {}", dest.display()));
                Ok(dest)
            })
    }

    /// Stop both GPU services, e.g. before exiting.
    pub async fn shutdown_services(&self) -> Result<()> {
        for service in [&self.comfyui, &self.applio] {
            if service.has_started() {
                logi(format!("Shutting down {}", service.name()));
                service.stop().await?;
            }
        }
        Ok(())
    }
}
