use clap::{Args, Parser, Subcommand};
use facewatch_core::{RenderConfig, VideoWorkerParams};
use facewatch_onnx::TrackerParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Parser)]
#[command(name = "facewatch", about = "Multi-stream face tracking and recognition")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Track and recognize faces on one or more video sources
    Run(RunArgs),
    /// Extract gallery templates into a template directory
    ExportTemplates(ExportArgs),
    /// List V4L2 capture devices
    Devices,
}

/// Where the face models live and which recognizer to use.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Directory containing det_10g.onnx and the recognizer models
    #[arg(long, alias = "config_dir", env = "FACEWATCH_CONFIG_DIR", default_value = "/usr/share/facewatch/models")]
    pub config_dir: PathBuf,

    /// License directory (unused by the ONNX backend)
    #[arg(long, alias = "license_dir", env = "FACEWATCH_LICENSE_DIR")]
    pub license_dir: Option<PathBuf>,

    /// Recognizer model name or file in the model directory
    #[arg(long, alias = "method_config", env = "FACEWATCH_METHOD_CONFIG", default_value = facewatch_onnx::service::DEFAULT_METHOD)]
    pub method_config: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Gallery directory: one subdirectory of photos per person
    #[arg(long, alias = "database_dir", env = "FACEWATCH_DATABASE_DIR")]
    pub database_dir: Option<PathBuf>,

    /// Maximum cosine distance accepted as a match
    #[arg(
        long,
        aliases = ["recognition-far-threshold", "recognition_distance_threshold", "recognition_far_threshold"],
        env = "FACEWATCH_RECOGNITION_DISTANCE_THRESHOLD",
        default_value_t = 0.6
    )]
    pub recognition_distance_threshold: f32,

    /// Capture rate cap per stream; 0 disables pacing
    #[arg(long, alias = "frame_fps_limit", env = "FACEWATCH_FRAME_FPS_LIMIT", default_value_t = 25.0)]
    pub frame_fps_limit: f64,

    /// Directory of persisted templates to add to the gallery
    #[arg(long, env = "FACEWATCH_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    /// Write the annotated image of each stream here as stream-<i>.png
    #[arg(long, env = "FACEWATCH_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// TrueType font for gallery names
    #[arg(long, env = "FACEWATCH_FONT")]
    pub font: Option<PathBuf>,

    /// TOML file with [video_worker], [tracker] and [render] sections
    #[arg(long, env = "FACEWATCH_VW_CONFIG")]
    pub vw_config: Option<PathBuf>,

    /// Log per-stream fps, face, track and match counters every second
    #[arg(long, alias = "show_metrics", env = "FACEWATCH_SHOW_METRICS")]
    pub show_metrics: bool,

    /// Requested camera width
    #[arg(long, default_value_t = 640)]
    pub width: u32,

    /// Requested camera height
    #[arg(long, default_value_t = 480)]
    pub height: u32,

    /// Camera index, /dev/videoN, image file or image directory, one per stream
    #[arg(required = true)]
    pub video_sources: Vec<String>,
}

impl RunArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.recognition_distance_threshold;
        if !threshold.is_finite() || !(0.0..=2.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "recognition distance threshold must be within [0, 2], got {threshold}"
            )));
        }
        if !self.frame_fps_limit.is_finite() {
            return Err(ConfigError::Invalid("frame fps limit must be finite".into()));
        }
        if self.video_sources.is_empty() {
            return Err(ConfigError::Invalid("at least one video source is required".into()));
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[arg(long, env = "FACEWATCH_DATABASE_DIR")]
    pub database_dir: PathBuf,

    /// Output template directory
    #[arg(long)]
    pub out: PathBuf,
}

/// Optional TOML parameters, all sections defaulted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub video_worker: VideoWorkerParams,
    pub tracker: TrackerParams,
    pub render: RenderConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
