use crate::prompts::ScriptStyle;
use crate::{Result, logw};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const STATE_FILE: &str = "project_state.json";
const SECTION_SEPARATOR: &str = "\n\n--- SECCIÓN ---\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSection {
    pub section: u32,
    pub script: String,
    pub script_file: PathBuf,
    #[serde(default)]
    pub image_prompts: Vec<String>,
    #[serde(default)]
    pub images: Vec<PathBuf>,
    #[serde(default)]
    pub audio: Option<PathBuf>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub file: PathBuf,
    pub generated_at: DateTime<Utc>,
}

/// Persisted progress of one project folder, rewritten after every section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub topic: String,
    pub folder_name: String,
    pub total_sections: u32,
    #[serde(default)]
    pub current_section: u32,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub script_style: ScriptStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_style_instructions: Option<String>,
    #[serde(default)]
    pub chapters: Vec<String>,
    #[serde(default)]
    pub images_per_section: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub completed_sections: Vec<CompletedSection>,
    #[serde(default)]
    pub youtube_metadata: Option<MetadataRecord>,
}

impl ProjectState {
    pub fn new(topic: impl Into<String>, folder_name: impl Into<String>, total_sections: u32) -> Self {
        let now = Utc::now();
        Self {
            topic: topic.into(),
            folder_name: folder_name.into(),
            total_sections,
            current_section: 0,
            model: String::new(),
            script_style: ScriptStyle::default(),
            custom_style_instructions: None,
            chapters: Vec::new(),
            images_per_section: 0,
            created_at: now,
            last_modified: now,
            completed_sections: Vec::new(),
            youtube_metadata: None,
        }
    }

    /// Read `project_state.json` from `project_dir`; `None` when there is none yet.
    pub async fn load(project_dir: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(project_dir.join(STATE_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn save(&mut self, project_dir: &Path) -> Result<()> {
        self.last_modified = Utc::now();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(project_dir.join(STATE_FILE), json).await?;
        Ok(())
    }

    pub fn completed(&self, section: u32) -> Option<&CompletedSection> {
        self.completed_sections.iter().find(|s| s.section == section)
    }

    pub fn completed_mut(&mut self, section: u32) -> Option<&mut CompletedSection> {
        self.completed_sections.iter_mut().find(|s| s.section == section)
    }

    /// Insert or replace the entry for `entry.section`, keeping entries sorted.
    pub fn record_section(&mut self, entry: CompletedSection) {
        match self.completed_mut(entry.section) {
            Some(existing) => *existing = entry,
            None => self.completed_sections.push(entry),
        }
        self.completed_sections.sort_by_key(|s| s.section);
        self.current_section = self
            .completed_sections
            .iter()
            .map(|s| s.section)
            .max()
            .unwrap_or(0);
    }

    pub fn is_complete(&self) -> bool {
        self.total_sections > 0
            && (1..=self.total_sections).all(|section| self.completed(section).is_some())
    }

    /// Every section's script, in order, joined with the section separator.
    pub fn full_script(&self) -> String {
        self.completed_sections
            .iter()
            .map(|s| s.script.as_str())
            .collect::<Vec<_>>()
            .join(SECTION_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub folder_name: String,
    pub topic: String,
    pub total_sections: u32,
    pub completed: usize,
    pub has_metadata: bool,
    pub last_modified: DateTime<Utc>,
}

impl From<&ProjectState> for ProjectSummary {
    fn from(state: &ProjectState) -> Self {
        Self {
            folder_name: state.folder_name.clone(),
            topic: state.topic.clone(),
            total_sections: state.total_sections,
            completed: state.completed_sections.len(),
            has_metadata: state.youtube_metadata.is_some(),
            last_modified: state.last_modified,
        }
    }
}

/// Projects under `output_dir` that carry a readable state file, most
/// recently modified first.
pub async fn list_projects(output_dir: &Path) -> Result<Vec<ProjectSummary>> {
    let mut entries = match fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut projects = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        match ProjectState::load(&path).await {
            Ok(Some(state)) => projects.push(ProjectSummary::from(&state)),
            Ok(None) => {}
            Err(e) => logw(format!("Skipping {}: {e}", path.display())),
        }
    }
    projects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    Ok(projects)
}

pub fn metadata_file_name(folder_name: &str) -> String {
    format!("{folder_name}_youtube_metadata.txt")
}

/// Write the metadata text plus the full script it was derived from.
pub async fn write_metadata(project_dir: &Path, state: &ProjectState, metadata: &str) -> Result<PathBuf> {
    let path = project_dir.join(metadata_file_name(&state.folder_name));
    let rule = "=".repeat(60);
    let content = format!(
        "METADATA DE YOUTUBE PARA: {topic}\n{rule}\n\nGenerado el: {date}\nNúmero de secciones: {count}\n\n{metadata}\n\n{rule}\nGUIÓN COMPLETO UTILIZADO:\n{rule}\n\n{script}",
        topic = state.topic,
        date = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        count = state.completed_sections.len(),
        metadata = metadata.trim(),
        script = state.full_script(),
    );
    fs::write(&path, content).await?;
    Ok(path)
}
