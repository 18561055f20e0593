use crate::error::{Error, Result};
use crate::{logi, logok, logw};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub launch_script: PathBuf,
    pub working_dir: Option<PathBuf>,
    /// Process image names to force-kill, e.g. `python.exe`.
    pub kill_images: Vec<String>,
    /// Console window title prefix of the launcher.
    pub window_title: String,
    pub startup_attempts: u32,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, launch_script: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            window_title: name.clone(),
            name,
            launch_script: launch_script.into(),
            working_dir: None,
            kill_images: Vec::new(),
            startup_attempts: 120,
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(3),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// Healthy when a GET on `url` answers with a 2xx status.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_healthy(&self) -> bool {
        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url = %self.url, "health probe failed: {err}");
                false
            }
        }
    }
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn launch(&self, spec: &ServiceSpec) -> Result<()>;
    async fn kill(&self, spec: &ServiceSpec) -> Result<()>;
}

/// Shared by services competing for the same GPU. `lifecycle` serializes
/// start and stop; `usage` is held for a whole job so a sibling cannot be
/// brought up underneath it. Lock order is `usage` then `lifecycle`.
#[derive(Clone, Default)]
pub struct GpuGate {
    lifecycle: Arc<AsyncMutex<()>>,
    usage: Arc<AsyncMutex<()>>,
}

/// Exclusive use of the GPU by one running service. Released on drop.
pub struct GpuLease {
    service: String,
    _guard: OwnedMutexGuard<()>,
}

impl GpuLease {
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        debug!(service = %self.service, "gpu lease released");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub pause: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 2,
            pause: Duration::from_secs(5),
        }
    }
}

pub struct ProcessSupervisor {
    spec: ServiceSpec,
    probe: Arc<dyn HealthProbe>,
    control: Arc<dyn ProcessControl>,
    gate: GpuGate,
    started: AtomicBool,
    conflicts: Mutex<Vec<Weak<ProcessSupervisor>>>,
}

impl ProcessSupervisor {
    pub fn new(
        spec: ServiceSpec,
        probe: Arc<dyn HealthProbe>,
        control: Arc<dyn ProcessControl>,
        gate: GpuGate,
    ) -> Self {
        Self {
            spec,
            probe,
            control,
            gate,
            started: AtomicBool::new(false),
            conflicts: Mutex::new(Vec::new()),
        }
    }

    /// Register two services as unable to run at the same time.
    pub fn mutually_exclusive(a: &Arc<Self>, b: &Arc<Self>) {
        a.add_conflict(b);
        b.add_conflict(a);
    }

    pub fn add_conflict(&self, other: &Arc<Self>) {
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(other));
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Whether this service was brought up at least once by this process.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn is_healthy(&self) -> bool {
        self.probe.is_healthy().await
    }

    pub async fn ensure_running(&self) -> Result<()> {
        let _gate = self.gate.lifecycle.lock().await;
        self.ensure_running_locked().await
    }

    /// Wait until no sibling is mid-job, then make sure this service is up and
    /// hold the GPU for it until the returned lease is dropped.
    pub async fn acquire_for_use(&self) -> Result<GpuLease> {
        let guard = Arc::clone(&self.gate.usage).lock_owned().await;
        self.ensure_running().await?;
        debug!(service = %self.spec.name, "gpu lease acquired");
        Ok(GpuLease {
            service: self.spec.name.clone(),
            _guard: guard,
        })
    }

    /// Force-kill the service and wait for the GPU to settle. Returns whether
    /// the health probe reports it down afterwards. Does not wait for leases.
    pub async fn stop(&self) -> Result<bool> {
        let _gate = self.gate.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Run a generation, restarting this service whenever it times out. After
    /// `policy.max_restarts` restarts the timeout is returned unchanged.
    pub async fn run_with_restart<F, Fut, T>(&self, policy: RestartPolicy, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut restarts = 0;
        loop {
            match op().await {
                Err(err) if err.is_generation_timeout() && restarts < policy.max_restarts => {
                    restarts += 1;
                    logw(format!(
                        "{} timed out ({err}); restart {}/{}",
                        self.spec.name, restarts, policy.max_restarts
                    ));
                    {
                        let _gate = self.gate.lifecycle.lock().await;
                        for other in self.conflicting() {
                            other.stop_locked().await?;
                        }
                        self.stop_locked().await?;
                    }
                    tokio::time::sleep(policy.pause).await;
                    self.ensure_running().await?;
                }
                Err(err) if err.is_generation_timeout() => {
                    logw(format!(
                        "{} still timing out after {} restarts; giving up",
                        self.spec.name, restarts
                    ));
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn ensure_running_locked(&self) -> Result<()> {
        if self.probe.is_healthy().await {
            self.started.store(true, Ordering::SeqCst);
            return Ok(());
        }

        for other in self.conflicting() {
            if other.probe.is_healthy().await {
                logi(format!(
                    "Stopping {} to free the GPU for {}",
                    other.spec.name, self.spec.name
                ));
                other.stop_locked().await?;
            }
        }

        let script = &self.spec.launch_script;
        if !tokio::fs::try_exists(script).await.unwrap_or(false) {
            return Err(Error::LaunchScriptMissing {
                service: self.spec.name.clone(),
                path: script.clone(),
            });
        }

        logi(format!("Launching {} ({})", self.spec.name, script.display()));
        self.control.launch(&self.spec).await?;

        let attempts = self.spec.startup_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(self.spec.poll_interval).await;
            if self.probe.is_healthy().await {
                self.started.store(true, Ordering::SeqCst);
                logok(format!("{} is up after {} probes", self.spec.name, attempt));
                return Ok(());
            }
            if attempt % 10 == 0 {
                debug!(service = %self.spec.name, attempt, attempts, "still waiting for startup");
            }
        }

        Err(Error::StartupTimeout {
            service: self.spec.name.clone(),
            attempts,
        })
    }

    async fn stop_locked(&self) -> Result<bool> {
        logi(format!("Stopping {}", self.spec.name));
        self.control.kill(&self.spec).await?;
        tokio::time::sleep(self.spec.settle_delay).await;
        let down = !self.probe.is_healthy().await;
        if down {
            logok(format!("{} stopped", self.spec.name));
        } else {
            logw(format!("{} still answers after kill", self.spec.name));
        }
        Ok(down)
    }

    fn conflicting(&self) -> Vec<Arc<ProcessSupervisor>> {
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Fake OS: launching a service makes its probe healthy, killing it
    /// makes it unhealthy. Every action is logged in order.
    #[derive(Default)]
    struct FakeHost {
        events: Mutex<Vec<String>>,
        healthy: Mutex<HashMap<String, bool>>,
        boots: Mutex<HashMap<String, bool>>,
    }

    impl FakeHost {
        fn set_healthy(&self, name: &str, up: bool) {
            self.healthy.lock().unwrap().insert(name.to_string(), up);
        }

        fn never_boots(&self, name: &str) {
            self.boots.lock().unwrap().insert(name.to_string(), false);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessControl for FakeHost {
        async fn launch(&self, spec: &ServiceSpec) -> Result<()> {
            self.events.lock().unwrap().push(format!("launch {}", spec.name));
            let boots = *self.boots.lock().unwrap().get(&spec.name).unwrap_or(&true);
            self.set_healthy(&spec.name, boots);
            Ok(())
        }

        async fn kill(&self, spec: &ServiceSpec) -> Result<()> {
            self.events.lock().unwrap().push(format!("kill {}", spec.name));
            self.set_healthy(&spec.name, false);
            Ok(())
        }
    }

    struct FakeProbe {
        host: Arc<FakeHost>,
        name: String,
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn is_healthy(&self) -> bool {
            *self.host.healthy.lock().unwrap().get(&self.name).unwrap_or(&false)
        }
    }

    fn supervisor(
        host: &Arc<FakeHost>,
        gate: &GpuGate,
        name: &str,
        script: PathBuf,
    ) -> Arc<ProcessSupervisor> {
        let mut spec = ServiceSpec::new(name, script);
        spec.startup_attempts = 3;
        spec.poll_interval = Duration::from_millis(1);
        spec.settle_delay = Duration::from_millis(1);
        let probe = Arc::new(FakeProbe {
            host: Arc::clone(host),
            name: name.to_string(),
        });
        let control: Arc<dyn ProcessControl> = host.clone();
        Arc::new(ProcessSupervisor::new(spec, probe, control, gate.clone()))
    }

    fn script(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        path
    }

    fn pair(host: &Arc<FakeHost>, dir: &tempfile::TempDir) -> (Arc<ProcessSupervisor>, Arc<ProcessSupervisor>) {
        let gate = GpuGate::default();
        let comfy = supervisor(host, &gate, "comfyui", script(dir, "comfy.sh"));
        let applio = supervisor(host, &gate, "applio", script(dir, "applio.sh"));
        ProcessSupervisor::mutually_exclusive(&comfy, &applio);
        (comfy, applio)
    }

    #[tokio::test]
    async fn healthy_service_is_not_relaunched() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, _applio) = pair(&host, &dir);
        host.set_healthy("comfyui", true);

        comfy.ensure_running().await.unwrap();

        assert!(host.events().is_empty());
        assert!(comfy.has_started());
    }

    #[tokio::test]
    async fn running_sibling_is_stopped_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, applio) = pair(&host, &dir);
        host.set_healthy("comfyui", true);

        applio.ensure_running().await.unwrap();

        assert_eq!(host.events(), vec!["kill comfyui", "launch applio"]);
        assert!(!comfy.is_healthy().await);
        assert!(applio.is_healthy().await);
    }

    #[tokio::test]
    async fn sibling_waits_for_lease_before_taking_the_gpu() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, applio) = pair(&host, &dir);

        let narrator = {
            let (host, applio) = (Arc::clone(&host), Arc::clone(&applio));
            tokio::spawn(async move {
                let _lease = applio.acquire_for_use().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                let alive = applio.is_healthy().await;
                host.events.lock().unwrap().push(format!("tts done, applio alive={alive}"));
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lease = comfy.acquire_for_use().await.unwrap();
        narrator.await.unwrap();

        assert_eq!(lease.service(), "comfyui");
        assert_eq!(
            host.events(),
            vec![
                "launch applio",
                "tts done, applio alive=true",
                "kill applio",
                "launch comfyui",
            ]
        );
    }

    #[tokio::test]
    async fn missing_launch_script_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let gate = GpuGate::default();
        let comfy = supervisor(&host, &gate, "comfyui", dir.path().join("absent.bat"));

        let err = comfy.ensure_running().await.unwrap_err();

        assert!(matches!(err, Error::LaunchScriptMissing { .. }));
        assert!(host.events().is_empty());
    }

    #[tokio::test]
    async fn startup_gives_up_after_attempt_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, _applio) = pair(&host, &dir);
        host.never_boots("comfyui");

        let err = comfy.ensure_running().await.unwrap_err();

        assert!(matches!(err, Error::StartupTimeout { attempts: 3, .. }));
        assert!(!comfy.has_started());
    }

    #[tokio::test]
    async fn timeout_restarts_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, _applio) = pair(&host, &dir);
        host.set_healthy("comfyui", true);

        let calls = AtomicU32::new(0);
        let policy = RestartPolicy {
            max_restarts: 2,
            pause: Duration::from_millis(1),
        };
        let err = comfy
            .run_with_restart(policy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::GenerationTimeout {
                        service: "comfyui".into(),
                        elapsed: Duration::from_secs(300),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_generation_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            host.events(),
            vec![
                "kill applio",
                "kill comfyui",
                "launch comfyui",
                "kill applio",
                "kill comfyui",
                "launch comfyui",
            ]
        );
    }

    #[tokio::test]
    async fn other_errors_pass_through_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::default());
        let (comfy, _applio) = pair(&host, &dir);

        let err = comfy
            .run_with_restart(RestartPolicy::default(), || async {
                Err::<(), _>(Error::GenerationFailed {
                    service: "comfyui".into(),
                    message: "bad graph".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::GenerationFailed { .. }));
        assert!(host.events().is_empty());
    }
}
