use crate::error::{Error, Result};
use crate::supervisor::{ProcessControl, ServiceSpec};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Launches services detached from this process and kills them by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

#[async_trait]
impl ProcessControl for SystemProcessControl {
    async fn launch(&self, spec: &ServiceSpec) -> Result<()> {
        let workdir = spec
            .working_dir
            .clone()
            .or_else(|| spec.launch_script.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| ".".into());
        launch_detached(&spec.launch_script, &workdir, &spec.window_title).await
    }

    async fn kill(&self, spec: &ServiceSpec) -> Result<()> {
        for image in &spec.kill_images {
            kill_image(image).await;
        }
        kill_launcher(spec).await;
        Ok(())
    }
}

#[cfg(target_os = "windows")]
async fn launch_detached(script: &Path, workdir: &Path, title: &str) -> Result<()> {
    // `start` opens its own console window and returns immediately
    let status = Command::new("cmd")
        .arg("/C")
        .arg("start")
        .arg(title)
        .arg("/D")
        .arg(workdir)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(Error::Process(format!(
            "start {} exited with {status}",
            script.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
async fn launch_detached(script: &Path, workdir: &Path, _title: &str) -> Result<()> {
    let child = Command::new("sh")
        .arg(script)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| Error::Process(format!("spawn {}: {e}", script.display())))?;
    debug!(pid = child.id(), script = %script.display(), "service launched");
    // dropping the handle leaves the process running
    drop(child);
    Ok(())
}

#[cfg(target_os = "windows")]
async fn kill_image(image: &str) {
    run_kill(Command::new("taskkill").args(["/F", "/T", "/IM", image])).await;
}

#[cfg(unix)]
async fn kill_image(image: &str) {
    run_kill(Command::new("pkill").args(["-9", "-x", image])).await;
}

#[cfg(target_os = "windows")]
async fn kill_launcher(spec: &ServiceSpec) {
    if spec.window_title.is_empty() {
        return;
    }
    let filter = format!("WINDOWTITLE eq {}*", spec.window_title);
    run_kill(Command::new("taskkill").args(["/F", "/T", "/FI", filter.as_str()])).await;
}

/// No console windows here; match the launcher's command line instead.
#[cfg(unix)]
async fn kill_launcher(spec: &ServiceSpec) {
    let pattern = spec.launch_script.to_string_lossy().into_owned();
    if pattern.is_empty() {
        return;
    }
    run_kill(Command::new("pkill").args(["-9", "-f", pattern.as_str()])).await;
}

/// Kill commands fail when nothing matches; that is not an error here.
async fn run_kill(cmd: &mut Command) {
    match cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => debug!(?status, "kill command finished"),
        Err(err) => warn!("kill command could not run: {err}"),
    }
}
