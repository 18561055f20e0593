use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tracing::debug;

/// Modification times of the watched paths, in candidate order, taken
/// before a request is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    modified: Vec<Option<SystemTime>>,
}

impl Baseline {
    pub fn modified(&self, index: usize) -> Option<SystemTime> {
        self.modified.get(index).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub source: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactWatcher {
    service: String,
    candidates: Vec<PathBuf>,
    pub min_bytes: u64,
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub settle: Duration,
    pub timeout: Duration,
}

impl ArtifactWatcher {
    pub fn new(service: impl Into<String>, candidates: Vec<PathBuf>) -> Self {
        Self {
            service: service.into(),
            candidates,
            min_bytes: 1000,
            initial_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            settle: Duration::from_secs(3),
            timeout: Duration::from_secs(20 * 60),
        }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub async fn baseline(&self) -> Baseline {
        let mut modified = Vec::with_capacity(self.candidates.len());
        for path in &self.candidates {
            modified.push(stat(path).await.map(|(m, _)| m));
        }
        Baseline { modified }
    }

    /// Wait until a new, complete artifact shows up.
    ///
    /// Only the first candidate that exists is watched, so an intermediate
    /// file listed later never wins over the final output.
    pub async fn wait_for_new(&self, baseline: &Baseline) -> Result<Artifact> {
        let started = Instant::now();
        tokio::time::sleep(self.initial_delay).await;

        loop {
            if started.elapsed() > self.timeout {
                return Err(Error::ArtifactTimeout {
                    service: self.service.clone(),
                    waited: started.elapsed(),
                });
            }

            if let Some((path, size)) = self.fresh_candidate(baseline).await {
                debug!(service = %self.service, path = %path.display(), size, "new artifact, settling");
                tokio::time::sleep(self.settle).await;
                match self.fresh_candidate(baseline).await {
                    Some((settled_path, settled)) if settled_path == path && settled == size => {
                        return Ok(Artifact {
                            source: path,
                            size: settled,
                        });
                    }
                    Some((settled_path, settled)) => {
                        debug!(service = %self.service, path = %settled_path.display(), before = size, after = settled, "artifact still changing");
                    }
                    None => {}
                }
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for a new artifact and copy it to `dest`.
    pub async fn collect(&self, baseline: &Baseline, dest: &Path) -> Result<Artifact> {
        let artifact = self.wait_for_new(baseline).await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&artifact.source, dest).await?;
        Ok(artifact)
    }

    async fn fresh_candidate(&self, baseline: &Baseline) -> Option<(PathBuf, u64)> {
        for (index, path) in self.candidates.iter().enumerate() {
            let Some((modified, size)) = stat(path).await else {
                continue;
            };
            let newer = baseline.modified(index).is_none_or(|before| modified > before);
            if newer && size > self.min_bytes {
                return Some((path.clone(), size));
            }
            return None;
        }
        None
    }
}

async fn stat(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    Some((meta.modified().ok()?, meta.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(candidates: Vec<PathBuf>) -> ArtifactWatcher {
        let mut watcher = ArtifactWatcher::new("applio", candidates);
        watcher.initial_delay = Duration::from_millis(5);
        watcher.poll_interval = Duration::from_millis(5);
        watcher.settle = Duration::from_millis(20);
        watcher.timeout = Duration::from_secs(5);
        watcher
    }

    #[tokio::test]
    async fn picks_up_file_written_after_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tts_rvc_output.wav");
        let watcher = fast(vec![out.clone()]);
        let baseline = watcher.baseline().await;
        assert_eq!(baseline.modified(0), None);

        let writer = {
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fs::write(&out, vec![0u8; 4096]).await.unwrap();
            })
        };

        let dest = dir.path().join("project/seccion_1/narration.wav");
        let artifact = watcher.collect(&baseline, &dest).await.unwrap();
        writer.await.unwrap();

        assert_eq!(artifact.source, out);
        assert_eq!(artifact.size, 4096);
        assert_eq!(fs::metadata(&dest).await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn ignores_stale_and_tiny_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tts_output.wav");
        fs::write(&out, vec![0u8; 4096]).await.unwrap();

        let mut watcher = fast(vec![out.clone()]);
        watcher.timeout = Duration::from_millis(80);
        let baseline = watcher.baseline().await;
        assert!(baseline.modified(0).is_some());

        let err = watcher.wait_for_new(&baseline).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactTimeout { .. }));

        let tiny = dir.path().join("tiny.wav");
        fs::write(&tiny, b"RIFF").await.unwrap();
        let watcher = {
            let mut w = fast(vec![tiny]);
            w.timeout = Duration::from_millis(80);
            w
        };
        let err = watcher.wait_for_new(&Baseline::default()).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactTimeout { .. }));
    }

    #[tokio::test]
    async fn converted_output_wins_over_intermediate_file() {
        let dir = tempfile::tempdir().unwrap();
        let rvc = dir.path().join("tts_rvc_output.wav");
        let tts = dir.path().join("tts_output.wav");
        fs::write(&rvc, vec![0u8; 2048]).await.unwrap();
        fs::write(&tts, vec![0u8; 2048]).await.unwrap();

        let watcher = fast(vec![rvc.clone(), tts.clone()]);
        let baseline = watcher.baseline().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let writer = {
            let (rvc, tts) = (rvc.clone(), tts.clone());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fs::write(&tts, vec![1u8; 5000]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                fs::write(&rvc, vec![2u8; 6000]).await.unwrap();
            })
        };

        let dest = dir.path().join("narration.wav");
        let artifact = watcher.collect(&baseline, &dest).await.unwrap();
        writer.await.unwrap();

        assert_eq!(artifact.source, rvc);
        assert_eq!(artifact.size, 6000);
        assert_eq!(fs::read(&dest).await.unwrap()[0], 2);
    }

    #[tokio::test]
    async fn falls_back_to_plain_output_when_converted_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let rvc = dir.path().join("tts_rvc_output.wav");
        let tts = dir.path().join("tts_output.wav");
        fs::write(&tts, vec![0u8; 2048]).await.unwrap();

        let watcher = fast(vec![rvc, tts.clone()]);
        let baseline = watcher.baseline().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&tts, vec![1u8; 5000]).await.unwrap();

        let artifact = watcher.wait_for_new(&baseline).await.unwrap();
        assert_eq!(artifact.source, tts);
        assert_eq!(artifact.size, 5000);
    }
}
