use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use facewatch_core::{template_store, Capturer, FaceService, Gallery, Recognizer, Renderer};
use facewatch_core::thumbnail::Labeler;
use facewatch_hw::{open_source, CameraOptions, V4lCamera};
use facewatch_onnx::OnnxService;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod engine;

use config::{BackendArgs, Cli, Commands, ExportArgs, FileConfig, RunArgs};
use display::{DisplaySink, NullSink, PngDirSink};
use engine::{Orchestrator, StreamSettings};

/// Main-loop period: deferred error checks and display updates.
const TICK: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().context("printing usage")?;
            std::process::exit(usage_exit_code(e.kind()));
        }
    };

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::ExportTemplates(args) => export_templates(args),
        Commands::Devices => {
            devices();
            Ok(())
        }
    }
}

/// Help and version requests succeed; every other argument error exits 1.
fn usage_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    args.validate()?;

    let file = match &args.vw_config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let labeler = args
        .font
        .as_deref()
        .map(Labeler::load)
        .transpose()
        .context("loading font")?
        .map(Arc::new);

    let service = open_service(&args.backend)?.with_tracker_params(file.tracker.clone());

    let gallery = {
        let mut capturer = service.create_capturer()?;
        let mut recognizer = service.create_recognizer(&args.backend.method_config)?;
        build_gallery(
            &args,
            capturer.as_mut(),
            recognizer.as_mut(),
            file.render.thumbnail_size,
            labeler.as_deref(),
        )?
    };
    tracing::info!(entries = gallery.len(), "gallery ready");

    let camera_options = CameraOptions {
        width: args.width,
        height: args.height,
    };
    let sources = args
        .video_sources
        .iter()
        .map(|source| {
            open_source(source, camera_options)
                .with_context(|| format!("opening video source {source}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut params = file.video_worker.clone();
    params.streams_count = sources.len();
    let acceleration = params.acceleration;
    let worker = service.create_video_worker(params, &args.backend.method_config)?;
    worker.set_database(gallery.entries().to_vec(), acceleration)?;

    let sink: Box<dyn DisplaySink> = match &args.output_dir {
        Some(dir) => Box::new(PngDirSink::create(dir)?),
        None => Box::new(NullSink),
    };

    let settings = StreamSettings {
        gallery_len: gallery.len(),
        renderer: Arc::new(Renderer::new(file.render.clone(), Arc::new(gallery), labeler)),
        fps_limit: args.frame_fps_limit,
        show_metrics: args.show_metrics,
    };

    let mut orchestrator = Orchestrator::start(worker, sources, settings, sink)?;
    tracing::info!(streams = orchestrator.streams().len(), "facewatch running");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(TICK);

    let result = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("waiting for Ctrl-C")?;
                tracing::info!("interrupted, shutting down");
                break Ok(());
            }
            _ = ticker.tick() => match orchestrator.tick() {
                Ok(true) => {
                    tracing::info!("all sources exhausted, shutting down");
                    break Ok(());
                }
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        }
    };

    let closed = orchestrator.close();
    result?;
    Ok(closed?)
}

fn open_service(backend: &BackendArgs) -> Result<OnnxService> {
    OnnxService::create(&backend.config_dir, backend.license_dir.as_deref())
        .with_context(|| format!("loading face models from {}", backend.config_dir.display()))
}

fn build_gallery(
    args: &RunArgs,
    capturer: &mut dyn Capturer,
    recognizer: &mut dyn Recognizer,
    thumbnail_size: u32,
    labeler: Option<&Labeler>,
) -> Result<Gallery> {
    let threshold = args.recognition_distance_threshold;

    let mut gallery = match &args.database_dir {
        Some(dir) => {
            let (gallery, skipped) =
                Gallery::load(dir, capturer, recognizer, threshold, thumbnail_size, labeler)?;
            if !skipped.is_empty() {
                tracing::warn!(count = skipped.len(), "gallery photos skipped");
            }
            gallery
        }
        None => Gallery::new(),
    };

    if let Some(dir) = &args.templates_dir {
        let method = recognizer.method_name().to_string();
        let templates = template_store::load(dir)?
            .into_iter()
            .filter(|(label, template)| match &template.method {
                Some(m) if *m != method => {
                    tracing::warn!(label = %label, method = %m, expected = %method, "template from another method, skipped");
                    false
                }
                _ => true,
            })
            .collect();
        gallery.extend_from_templates(templates, threshold, thumbnail_size, labeler);
    }

    Ok(gallery)
}

fn export_templates(args: ExportArgs) -> Result<()> {
    let service = open_service(&args.backend)?;
    let mut capturer = service.create_capturer()?;
    let mut recognizer = service.create_recognizer(&args.backend.method_config)?;

    let (gallery, _) = Gallery::load(
        &args.database_dir,
        capturer.as_mut(),
        recognizer.as_mut(),
        f32::INFINITY,
        facewatch_core::thumbnail::DEFAULT_THUMBNAIL_SIZE,
        None,
    )?;

    for (entry, name) in gallery.entries().iter().zip(gallery.names()) {
        let label = export_label(name, entry.person_id, entry.element_id);
        let path = template_store::save(&args.out, &label, &entry.template)?;
        println!("{}", path.display());
    }
    println!("Exported {} templates to {}", gallery.len(), args.out.display());
    Ok(())
}

/// Label of an exported template: the person name when known, made unique by element id.
fn export_label(name: &str, person_id: u64, element_id: u64) -> String {
    let base: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let base = base.trim_matches('_');
    if base.is_empty() {
        format!("person{person_id}_{element_id}")
    } else {
        format!("{base}_{element_id}")
    }
}

fn devices() {
    let devices = V4lCamera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}
