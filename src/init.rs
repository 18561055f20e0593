use crate::config::Config;
use crate::{logi, logw};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// Create the output root if it is missing.
pub async fn ensure_directories(cfg: &Config) -> Result<()> {
    let dir = &cfg.output_dir;
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output dir {}", dir.display()))?;
        logi(format!("Created directory: {}", dir.display()));
    }
    Ok(())
}

/// Warn about launch scripts that are configured but absent. Nothing fails
/// here; the supervisor reports the error when a start is attempted.
pub fn check_launch_scripts(cfg: &Config) -> usize {
    let scripts = [
        ("ComfyUI", cfg.comfyui.launch_script.clone()),
        ("Applio", cfg.applio_launch_script()),
    ];
    let mut missing = 0;
    for (name, script) in scripts {
        if !Path::new(&script).exists() {
            logw(format!("{name} launch script not found: {}", script.display()));
            missing += 1;
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_missing_output_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::from_json("{}").unwrap();
        cfg.output_dir = tmp.path().join("public").join("outputs");

        ensure_directories(&cfg).await.unwrap();
        assert!(cfg.output_dir.is_dir());
        ensure_directories(&cfg).await.unwrap();
    }

    #[test]
    fn counts_missing_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::from_json("{}").unwrap();
        cfg.comfyui.launch_script = tmp.path().join("nope.bat");
        cfg.applio.launch_script = Some(tmp.path().join("also-nope.bat"));
        assert_eq!(check_launch_scripts(&cfg), 2);

        std::fs::write(&cfg.comfyui.launch_script, "echo").unwrap();
        assert_eq!(check_launch_scripts(&cfg), 1);
    }
}
