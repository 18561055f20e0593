use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use content_forge::config::Config;
use content_forge::coordinator::{Coordinator, ImageBackend, VoiceBackend};
use content_forge::generator::{GenerationRequest, run_generation};
use content_forge::init;
use content_forge::project::list_projects;
use content_forge::prompts::ScriptStyle;

#[derive(Debug, Parser)]
#[command(name = "content-forge", version, about = "Sectioned script, image and narration generation")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Topic of the project; an existing project with the same topic is resumed
    #[arg(long, required_unless_present = "list_projects")]
    topic: Option<String>,

    /// Print saved projects, newest first, and exit
    #[arg(long)]
    list_projects: bool,

    /// Number of sections to generate
    #[arg(long, default_value_t = 3)]
    sections: u32,

    #[arg(long, value_enum, default_value_t = VoiceBackend::Applio)]
    voice_backend: VoiceBackend,

    #[arg(long, value_enum, default_value_t = ImageBackend::ComfyUi)]
    image_backend: ImageBackend,

    /// LLM model; names containing "gpt" are sent to OpenAI
    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value_t = 1)]
    images_per_section: u32,

    /// Tone for Google TTS narration, e.g. "con entusiasmo"
    #[arg(long)]
    narration_style: Option<String>,

    #[arg(long, value_enum, default_value_t = ScriptStyle::Professional)]
    style: ScriptStyle,

    /// Style instructions used with `--style custom`
    #[arg(long)]
    custom_style: Option<String>,

    /// Start over even if the project folder has saved progress
    #[arg(long)]
    fresh: bool,

    /// Skip YouTube titles, description and tags once all sections are done
    #[arg(long)]
    no_metadata: bool,

    /// Leave ComfyUI and Applio running when the run ends
    #[arg(long)]
    keep_services: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("content_forge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    init::ensure_directories(&config).await?;

    if args.list_projects {
        for project in list_projects(&config.output_dir).await? {
            println!(
                "{:<40} {}/{} sections{}  {}  {}",
                project.folder_name,
                project.completed,
                project.total_sections,
                if project.has_metadata { ", metadata" } else { "" },
                project.last_modified.format("%Y-%m-%d %H:%M"),
                project.topic
            );
        }
        return Ok(());
    }
    let Some(topic) = args.topic else {
        anyhow::bail!("--topic is required");
    };
    if args.style == ScriptStyle::Custom && args.custom_style.is_none() {
        warn!("--style custom without --custom-style; using the professional prompt");
    }

    let missing = init::check_launch_scripts(&config);
    if missing > 0 {
        warn!("{missing} launch script(s) missing; those services cannot be auto-started");
    }

    let http = reqwest::Client::builder()
        .cookie_store(true)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .context("Failed to build HTTP client")?;

    let request = GenerationRequest {
        topic,
        sections: args.sections,
        model: args.model.unwrap_or_else(|| config.llm_model.clone()),
        voice: args.voice_backend,
        images: args.image_backend,
        images_per_section: args.images_per_section,
        narration_style: args.narration_style,
        style: args.style,
        custom_style: args.custom_style,
        fresh: args.fresh,
        youtube_metadata: !args.no_metadata,
    };
    let coord = Coordinator::new(config, http);

    let interrupt = {
        let coord = coord.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && coord.cancel_images() {
                warn!("Interrupt received; image generation will stop at the next step");
            }
        })
    };

    let result = run_generation(&coord, &request).await;
    interrupt.abort();

    if !args.keep_services {
        if let Err(e) = coord.shutdown_services().await {
            warn!("Service shutdown failed: {e}");
        }
    }

    match result {
        Ok(outcomes) => {
            let done = outcomes.iter().filter(|o| o.is_complete()).count();
            let resumed = outcomes.iter().filter(|o| o.resumed).count();
            let audio = outcomes.iter().filter(|o| o.audio.is_some()).count();
            let images: usize = outcomes.iter().map(|o| o.images.len()).sum();
            info!(
                "Completed {done}/{} sections ({resumed} resumed, {audio} narrations, {images} images)",
                request.sections
            );
            Ok(())
        }
        Err(e) => {
            error!("Generation failed: {e:#}");
            std::process::exit(1);
        }
    }
}
