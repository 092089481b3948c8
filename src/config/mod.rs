//! Configuration loading and validation utilities.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, instrument};

use crate::PipelineError;

/// Document consulted when `--config` is not given. Its absence is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "vanish.toml";

/// Command-line arguments used to bootstrap the runtime.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Vanish video object removal")]
pub struct CliArgs {
    /// Pipeline configuration document.
    #[arg(long, value_name = "PATH", env = "VANISH_CONFIG")]
    pub config: Option<PathBuf>,
    /// Color video (container file or directory of numbered images).
    #[arg(long, value_name = "PATH")]
    pub color_video: PathBuf,
    /// Mask video aligned with the color video; white marks the region to remove.
    #[arg(long, value_name = "PATH")]
    pub mask_video: Option<PathBuf>,
    /// Prompt annotations used to generate a mask when no mask video is supplied.
    #[arg(long, value_name = "PATH")]
    pub annotations: Option<PathBuf>,
    /// Where masks generated from `--annotations` are written for reuse as `--mask-video`.
    #[arg(long, value_name = "PATH")]
    pub mask_output: Option<PathBuf>,
    /// Output location (defaults to `<input>_vanished`).
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Longest side of the inference resolution.
    #[arg(long, value_name = "PIXELS", env = "VANISH_RESOLUTION")]
    pub resolution: Option<u32>,
    /// Maximum number of frames per inference chunk.
    #[arg(long, value_name = "FRAMES", env = "VANISH_CHUNK_LEN")]
    pub chunk_len: Option<usize>,
    /// Frames shared between consecutive chunks.
    #[arg(long, value_name = "FRAMES", env = "VANISH_OVERLAP")]
    pub overlap: Option<usize>,
    /// Concurrent chunk workers.
    #[arg(long, value_name = "COUNT", env = "VANISH_WORKERS")]
    pub workers: Option<usize>,
    /// Index of the first frame to process.
    #[arg(long, value_name = "INDEX")]
    pub start_frame: Option<usize>,
    /// Maximum number of frames to process after `--start-frame`.
    #[arg(long, value_name = "FRAMES")]
    pub max_frames: Option<usize>,
    /// Pixels by which the mask is grown before inpainting.
    #[arg(long, value_name = "PIXELS")]
    pub mask_dilation: Option<u32>,
    /// Feather radius used when compositing the inpainted region.
    #[arg(long, value_name = "PIXELS")]
    pub feather: Option<u32>,
    /// Keep soft mask coverage instead of thresholding it.
    #[arg(long)]
    pub soft_mask: bool,
    /// Frame rate for image-sequence inputs and outputs.
    #[arg(long, value_name = "FPS")]
    pub fps: Option<f64>,
}

/// Chunk geometry handed to the planner.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_len: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_len: 50,
            overlap: 10,
        }
    }
}

/// Inference limits and worker layout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Longest side of the resolution frames are downscaled to.
    pub max_resolution: u32,
    /// Floor for caller-driven resolution halving.
    pub min_resolution: u32,
    pub workers: usize,
    /// Physical accelerator devices available to the run.
    pub devices: usize,
    /// Allows more than one in-flight call per device.
    pub partition_device_memory: bool,
    /// Memory budget per device; zero disables the estimate gate.
    pub device_memory_mb: f32,
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_resolution: 960,
            min_resolution: 120,
            workers: 1,
            devices: 1,
            partition_device_memory: false,
            device_memory_mb: 0.0,
            timeout_secs: 600,
        }
    }
}

impl InferenceConfig {
    /// Number of inference calls allowed in flight at once.
    pub fn inference_slots(&self) -> usize {
        if self.partition_device_memory {
            self.workers.max(1)
        } else {
            self.workers.min(self.devices).max(1)
        }
    }
}

/// Interpolation kernel used when resizing.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResampleFilter {
    /// Box average over the covered source area.
    Area,
    Nearest,
    Bilinear,
    Lanczos,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResampleConfig {
    pub color: ResampleFilter,
    pub mask: ResampleFilter,
    pub upscale: ResampleFilter,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            color: ResampleFilter::Area,
            mask: ResampleFilter::Nearest,
            upscale: ResampleFilter::Bilinear,
        }
    }
}

/// Weight curve applied across an overlap.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlendCurve {
    #[default]
    Linear,
    Smoothstep,
}

impl BlendCurve {
    /// Maps a linear ramp value in `[0, 1]` through the curve.
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            BlendCurve::Linear => t,
            BlendCurve::Smoothstep => t * t * (3.0 - 2.0 * t),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlendConfig {
    pub curve: BlendCurve,
    /// Restrict overlap blending to masked pixels when originals are available.
    pub masked_only: bool,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            curve: BlendCurve::Linear,
            masked_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompositeConfig {
    pub feather_px: u32,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self { feather_px: 2 }
    }
}

/// Mask preparation and frame IO settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    /// Frame rate assumed for image sequences.
    pub fps: f64,
    pub mask_threshold: f32,
    pub soft_mask: bool,
    pub mask_dilation: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            mask_threshold: 0.5,
            soft_mask: false,
            mask_dilation: 8,
        }
    }
}

/// Settings for the built-in region-growing segmenter.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Maximum per-channel distance from the seed color accepted while growing.
    pub color_tolerance: u8,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            color_tolerance: 24,
        }
    }
}

/// Parsed pipeline document.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub inference: InferenceConfig,
    pub resample: ResampleConfig,
    pub blend: BlendConfig,
    pub composite: CompositeConfig,
    pub io: IoConfig,
    pub segmentation: SegmentationConfig,
}

impl PipelineConfig {
    pub fn from_toml(raw: &str) -> Result<Self, PipelineError> {
        toml::from_str(raw)
            .map_err(|err| PipelineError::Config(format!("invalid pipeline document: {err}")))
    }

    /// Rejects parameter combinations that cannot run, before any inference happens.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let chunking = &self.chunking;
        if chunking.chunk_len == 0 {
            return Err(PipelineError::Config(
                "chunk length must be positive".to_string(),
            ));
        }
        if chunking.overlap >= chunking.chunk_len {
            return Err(PipelineError::Config(format!(
                "overlap {} must be smaller than chunk length {}",
                chunking.overlap, chunking.chunk_len
            )));
        }
        let inference = &self.inference;
        if inference.max_resolution < 8 {
            return Err(PipelineError::Config(format!(
                "inference resolution {} is below the 8 pixel minimum",
                inference.max_resolution
            )));
        }
        if inference.min_resolution == 0 || inference.min_resolution > inference.max_resolution {
            return Err(PipelineError::Config(format!(
                "minimum resolution {} must be within (0, {}]",
                inference.min_resolution, inference.max_resolution
            )));
        }
        if inference.workers == 0 || inference.devices == 0 {
            return Err(PipelineError::Config(
                "workers and devices must be positive".to_string(),
            ));
        }
        if inference.timeout_secs == 0 {
            return Err(PipelineError::Config(
                "inference timeout must be positive".to_string(),
            ));
        }
        if !(inference.device_memory_mb >= 0.0) {
            return Err(PipelineError::Config(
                "device memory budget must be non-negative".to_string(),
            ));
        }
        if !(self.io.fps > 0.0) {
            return Err(PipelineError::Config(format!(
                "frame rate {} must be positive",
                self.io.fps
            )));
        }
        if !(0.0..=1.0).contains(&self.io.mask_threshold) {
            return Err(PipelineError::Config(format!(
                "mask threshold {} outside [0, 1]",
                self.io.mask_threshold
            )));
        }
        if self.composite.feather_px > 64 {
            return Err(PipelineError::Config(format!(
                "feather radius {} exceeds 64 pixels",
                self.composite.feather_px
            )));
        }
        Ok(())
    }
}

/// Window of source frames to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameWindow {
    pub start: usize,
    pub max_frames: Option<usize>,
}

/// Fully merged configuration set.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cli: CliArgs,
    pub pipeline: PipelineConfig,
    pub color_video: PathBuf,
    pub mask_video: Option<PathBuf>,
    pub annotations: Option<PathBuf>,
    pub mask_output: Option<PathBuf>,
    pub output_path: PathBuf,
    pub window: FrameWindow,
}

impl AppConfig {
    #[instrument(skip_all)]
    pub async fn load(cli: CliArgs) -> Result<Self, PipelineError> {
        let mut pipeline = match &cli.config {
            Some(path) => {
                let raw = fs::read_to_string(path).await.map_err(|err| {
                    PipelineError::Config(format!(
                        "failed to read config {}: {err}",
                        path.display()
                    ))
                })?;
                PipelineConfig::from_toml(&raw)?
            }
            None => match fs::read_to_string(DEFAULT_CONFIG_PATH).await {
                Ok(raw) => PipelineConfig::from_toml(&raw)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = DEFAULT_CONFIG_PATH, "no config document, using defaults");
                    PipelineConfig::default()
                }
                Err(err) => {
                    return Err(PipelineError::Config(format!(
                        "failed to read config {DEFAULT_CONFIG_PATH}: {err}"
                    )));
                }
            },
        };

        if let Some(resolution) = cli.resolution {
            pipeline.inference.max_resolution = resolution;
            pipeline.inference.min_resolution = pipeline.inference.min_resolution.min(resolution);
        }
        if let Some(chunk_len) = cli.chunk_len {
            pipeline.chunking.chunk_len = chunk_len;
        }
        if let Some(overlap) = cli.overlap {
            pipeline.chunking.overlap = overlap;
        }
        if let Some(workers) = cli.workers {
            pipeline.inference.workers = workers;
        }
        if let Some(dilation) = cli.mask_dilation {
            pipeline.io.mask_dilation = dilation;
        }
        if let Some(feather) = cli.feather {
            pipeline.composite.feather_px = feather;
        }
        if let Some(fps) = cli.fps {
            pipeline.io.fps = fps;
        }
        if cli.soft_mask {
            pipeline.io.soft_mask = true;
            pipeline.resample.mask = ResampleFilter::Area;
        }
        pipeline.validate()?;

        if cli.max_frames == Some(0) {
            return Err(PipelineError::Config(
                "max frames must be positive".to_string(),
            ));
        }

        Ok(Self {
            output_path: cli
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&cli.color_video)),
            color_video: cli.color_video.clone(),
            mask_video: cli.mask_video.clone(),
            annotations: cli.annotations.clone(),
            mask_output: cli.mask_output.clone(),
            window: FrameWindow {
                start: cli.start_frame.unwrap_or(0),
                max_frames: cli.max_frames,
            },
            pipeline,
            cli,
        })
    }
}

/// `clip.mp4` becomes `clip.mp4_vanished.mkv`; an image directory `shots/` becomes `shots_vanished/`.
pub fn default_output_path(color_video: &Path) -> PathBuf {
    let mut name = color_video.components().as_path().as_os_str().to_os_string();
    if color_video.is_dir() {
        name.push("_vanished");
    } else {
        name.push("_vanished.mkv");
    }
    PathBuf::from(name)
}
