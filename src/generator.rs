use crate::coordinator::{Coordinator, ImageBackend, VoiceBackend};
use crate::project::{CompletedSection, MetadataRecord, ProjectState, write_metadata};
use crate::prompts::{self, ScriptStyle, SectionContext};
use crate::queue::TaskHandle;
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

const MAX_FOLDER_CHARS: usize = 50;
const SCRIPT_FILE: &str = "guion.txt";

static NON_ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s]").expect("folder pattern"));
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space pattern"));
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(secci[oó]n \d+:|gui[oó]n:|texto del gui[oó]n:|contenido:|\*\*secci[oó]n \d+\*\*|# secci[oó]n \d+|-{3,}|\*\*gui[oó]n para tts:\*\*|\*\*respuesta:\*\*|aqu[ií] est[aá] el gui[oó]n:|el gui[oó]n para la secci[oó]n \d+ es:)",
    )
    .expect("header pattern")
});

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub topic: String,
    pub sections: u32,
    pub model: String,
    pub voice: VoiceBackend,
    pub images: ImageBackend,
    pub images_per_section: u32,
    pub narration_style: Option<String>,
    pub style: ScriptStyle,
    /// Instructions for [`ScriptStyle::Custom`].
    pub custom_style: Option<String>,
    /// Ignore progress saved in the project folder.
    pub fresh: bool,
    pub youtube_metadata: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionOutcome {
    pub section: u32,
    pub script: Option<PathBuf>,
    pub images: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
    pub error: Option<String>,
    pub resumed: bool,
}

impl SectionOutcome {
    fn new(section: u32) -> Self {
        Self {
            section,
            script: None,
            images: Vec::new(),
            audio: None,
            error: None,
            resumed: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.script.is_some()
    }
}

struct Narration {
    outcome: usize,
    section: u32,
    handle: TaskHandle<PathBuf>,
}

/// Lowercase, strip everything but ascii letters, digits and spaces, join
/// words with underscores and cap the length.
pub fn safe_folder_name(topic: &str) -> String {
    let lower = topic.to_lowercase();
    let kept = NON_ALNUM_RE.replace_all(&lower, "");
    let joined = SPACES_RE.replace_all(kept.trim(), "_");
    joined.chars().take(MAX_FOLDER_CHARS).collect()
}

/// Strip headings, separators and commentary lines the model adds around
/// the narration text.
pub fn clean_script_text(text: &str) -> String {
    let mut clean = text.trim().to_string();
    while let Some(m) = HEADER_RE.find(&clean) {
        clean = clean[m.end()..].trim().to_string();
    }
    clean
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('*')
                && !line.starts_with('#')
                && !line.starts_with("//")
                && !line.starts_with("Nota:")
                && !line.starts_with("Aclaración:")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create dir {}", path.display()))
}

/// Saved state for `folder` when it belongs to the same topic, otherwise a
/// blank one, updated with this request's settings.
async fn open_project(project_dir: &Path, folder: &str, req: &GenerationRequest) -> ProjectState {
    let saved = if req.fresh {
        None
    } else {
        match ProjectState::load(project_dir).await {
            Ok(saved) => saved,
            Err(err) => {
                logw(format!("Ignoring unreadable project state: {err}"));
                None
            }
        }
    };

    let mut state = match saved {
        Some(state) if state.topic == req.topic => {
            logi(format!(
                "Resuming {} ({}/{} sections done)",
                state.folder_name,
                state.completed_sections.len(),
                state.total_sections
            ));
            state
        }
        Some(state) => {
            logw(format!("{folder} held {:?}; starting a new project", state.topic));
            ProjectState::new(&req.topic, folder, req.sections)
        }
        None => ProjectState::new(&req.topic, folder, req.sections),
    };

    if state.total_sections != req.sections {
        state.chapters.clear();
        state.total_sections = req.sections;
    }
    state.model = req.model.clone();
    state.script_style = req.style;
    state.custom_style_instructions = req.custom_style.clone();
    state.images_per_section = req.images_per_section;
    state
}

async fn plan_chapters(coord: &Coordinator, req: &GenerationRequest) -> crate::Result<Vec<String>> {
    let prompt = prompts::chapter_prompt(&req.topic, req.sections);
    let text = coord
        .generate_text(&req.model, &prompt, Some(prompts::CHAPTERS_SYSTEM))
        .await?;
    Ok(prompts::split_chapters(&text, req.sections))
}

fn queue_narration(
    coord: &Arc<Coordinator>,
    req: &GenerationRequest,
    run_id: &str,
    order: u64,
    script: String,
    dest: PathBuf,
) -> crate::Result<TaskHandle<PathBuf>> {
    match req.voice {
        VoiceBackend::Applio => coord.narrate_applio(run_id, order, script, dest),
        VoiceBackend::Google => coord.narrate_google(run_id, order, script, dest, req.narration_style.clone()),
    }
}

async fn generate_metadata(
    coord: &Coordinator,
    model: &str,
    project_dir: &Path,
    state: &ProjectState,
) -> Result<MetadataRecord> {
    let prompt = prompts::metadata_prompt(&state.topic, &state.full_script());
    let text = coord.generate_text(model, &prompt, None).await?;
    let file = write_metadata(project_dir, state, &text).await?;
    Ok(MetadataRecord {
        file,
        generated_at: Utc::now(),
    })
}

/// Produce script, images and narration for every section of `req.topic`.
///
/// Narrations are queued as soon as each script exists and are awaited at
/// the end, so audio for section N renders while section N+1 is written.
/// Sections recorded in the folder's `project_state.json` are skipped and
/// only re-narrated when their audio file is gone. A fatal credential error
/// stops the run after draining what was queued.
pub async fn run_generation(coord: &Arc<Coordinator>, req: &GenerationRequest) -> Result<Vec<SectionOutcome>> {
    let folder = safe_folder_name(&req.topic);
    if folder.is_empty() {
        anyhow::bail!("topic {:?} has no usable characters for a folder name", req.topic);
    }
    let project_dir = coord.config().output_dir.join(&folder);
    ensure_dir(&project_dir).await?;
    let mut state = open_project(&project_dir, &folder, req).await;

    let run_id = Uuid::new_v4().to_string();
    logi(format!(
        "=== {} ({} sections, {:?} style, model {}, run {}) ===",
        req.topic, req.sections, req.style, req.model, run_id
    ));

    if state.chapters.is_empty() && req.sections > 1 {
        match plan_chapters(coord, req).await {
            Ok(chapters) => {
                logok(format!("Chapter structure: {}", chapters.join(" | ")));
                state.chapters = chapters;
            }
            Err(err) if err.is_fatal() => {
                return Err(err).context(format!("generation of {:?} aborted", req.topic));
            }
            Err(err) => logw(format!("Chapter structure failed, continuing without it: {err}")),
        }
    }

    let image_session = coord.start_image_session();
    let mut outcomes: Vec<SectionOutcome> = Vec::new();
    let mut narrations: Vec<Narration> = Vec::new();
    let mut previous: Vec<(u32, String)> = Vec::new();
    let mut next_order: u64 = 0;
    let mut images_enabled = req.images != ImageBackend::None;
    let mut fatal: Option<crate::Error> = None;

    for section in 1..=req.sections {
        let section_dir = project_dir.join(format!("seccion_{section}"));
        ensure_dir(&section_dir).await?;
        let audio_dest = section_dir.join(format!("{folder}_seccion_{section}.wav"));
        let mut outcome = SectionOutcome::new(section);

        if let Some(done) = state.completed(section).cloned() {
            logi(format!("--- Section {}/{} already done ---", section, req.sections));
            outcome.resumed = true;
            outcome.script = Some(done.script_file);
            outcome.images = done.images;
            match done.audio.filter(|path| path.exists()) {
                Some(path) => outcome.audio = Some(path),
                None => match queue_narration(coord, req, &run_id, next_order, done.script.clone(), audio_dest) {
                    Ok(handle) => {
                        next_order += 1;
                        narrations.push(Narration { outcome: outcomes.len(), section, handle });
                    }
                    Err(err) => logw(format!("Section {section} narration not queued: {err}")),
                },
            }
            previous.push((section, done.script));
            outcomes.push(outcome);
            continue;
        }

        logi(format!("--- Section {}/{} ---", section, req.sections));
        let context = SectionContext {
            topic: &req.topic,
            sections: req.sections,
            section,
            chapters: &state.chapters,
            previous: &previous,
            custom_instructions: req.custom_style.as_deref(),
        };
        let prompt = prompts::script_prompt(req.style, &context);
        let script = match coord.generate_text(&req.model, &prompt, Some(prompts::SCRIPT_SYSTEM)).await {
            Ok(raw) => clean_script_text(&raw),
            Err(err) if err.is_fatal() => {
                logw(format!("Aborting run: {err}"));
                outcome.error = Some(err.to_string());
                outcomes.push(outcome);
                fatal = Some(err);
                break;
            }
            Err(err) => {
                logw(format!("Section {section} script failed: {err}"));
                outcome.error = Some(err.to_string());
                outcomes.push(outcome);
                continue;
            }
        };

        let script_path = section_dir.join(SCRIPT_FILE);
        fs::write(&script_path, &script).await?;
        outcome.script = Some(script_path.clone());
        logok(format!("Section {section} script: {} chars", script.chars().count()));

        match queue_narration(coord, req, &run_id, next_order, script.clone(), audio_dest) {
            Ok(handle) => {
                next_order += 1;
                narrations.push(Narration { outcome: outcomes.len(), section, handle });
            }
            Err(err) => logw(format!("Section {section} narration not queued: {err}")),
        }

        let mut image_prompts = Vec::new();
        if images_enabled && req.images_per_section > 0 {
            let request = prompts::image_prompts_request(&script, req.images_per_section);
            match coord.generate_text(&req.model, &request, Some(prompts::PROMPTS_SYSTEM)).await {
                Ok(text) => {
                    image_prompts = prompts::split_image_prompts(&text, req.images_per_section as usize);
                    logi(format!("Section {section}: {} image prompts", image_prompts.len()));
                    for (i, image_prompt) in image_prompts.iter().enumerate() {
                        match coord
                            .generate_image(req.images, &image_session, image_prompt, &section_dir)
                            .await
                        {
                            Ok(Some(path)) => {
                                logok(format!("Image {}/{}: {}", i + 1, image_prompts.len(), path.display()));
                                outcome.images.push(path);
                            }
                            Ok(None) => {}
                            Err(err) if err.is_cancelled() => {
                                logw("Image generation cancelled; continuing without images");
                                images_enabled = false;
                                break;
                            }
                            Err(err) => logw(format!("Image {} failed: {err}", i + 1)),
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    logw(format!("Aborting run: {err}"));
                    outcome.error = Some(err.to_string());
                    outcomes.push(outcome);
                    fatal = Some(err);
                    break;
                }
                Err(err) => logw(format!("Section {section} image prompts failed: {err}")),
            }
        }

        state.record_section(CompletedSection {
            section,
            script: script.clone(),
            script_file: script_path,
            image_prompts,
            images: outcome.images.clone(),
            audio: None,
            completed_at: Utc::now(),
        });
        if let Err(err) = state.save(&project_dir).await {
            logw(format!("Could not save project state: {err}"));
        }
        previous.push((section, script));
        outcomes.push(outcome);
    }
    coord.finish_image_session(&image_session);

    if !narrations.is_empty() {
        logi(format!("Waiting for {} narrations...", narrations.len()));
    }
    for narration in narrations {
        let label = narration.handle.label().to_string();
        match narration.handle.await {
            Ok(path) => {
                logok(format!("{label}: {}", path.display()));
                if let Some(done) = state.completed_mut(narration.section) {
                    done.audio = Some(path.clone());
                }
                if let Some(outcome) = outcomes.get_mut(narration.outcome) {
                    outcome.audio = Some(path);
                }
            }
            Err(err) => {
                logw(format!("{label} failed: {err}"));
                if let Some(outcome) = outcomes.get_mut(narration.outcome) {
                    outcome.error.get_or_insert_with(|| err.to_string());
                }
            }
        }
    }

    if fatal.is_none() && req.youtube_metadata && state.is_complete() && state.youtube_metadata.is_none() {
        logi("All sections done; generating YouTube metadata...");
        match generate_metadata(coord, &req.model, &project_dir, &state).await {
            Ok(record) => {
                logok(format!("YouTube metadata: {}", record.file.display()));
                state.youtube_metadata = Some(record);
            }
            Err(err) => logw(format!("YouTube metadata failed: {err:#}")),
        }
    }
    state.save(&project_dir).await?;

    if let Some(err) = fatal {
        return Err(err).context(format!("generation of {:?} aborted", req.topic));
    }

    let done = outcomes.iter().filter(|o| o.is_complete()).count();
    logi(format!("All done. Completed sections: {}/{}", done, req.sections));
    Ok(outcomes)
}
