//! Core library for the Vanish object-removal pipeline.
//!
//! The crate exposes the frame and mask data model shared by every stage, the
//! interactive mask session, the chunked inpainting pipeline, configuration
//! loading, and the orchestration entry point used by the CLI application.

pub mod arc;
pub mod config;
pub mod inference;
pub mod mask;
pub mod pipeline;

use std::{fmt::Display, sync::Arc};

use image::GrayImage;
use imageproc::morphology::{Mask, grayscale_dilate};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::pipeline::ChunkReport;

/// Convenient alias for a shared byte buffer.
pub type SharedBytes = Arc<[u8]>;

/// Width and height of a frame or of an inference target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn longest_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width as f32 && y < self.height as f32
    }

    /// Scales the resolution so that its longest side does not exceed `max_side`.
    ///
    /// Aspect ratio is preserved and both sides are rounded down to a multiple of
    /// eight, which latent-space inpainting models require. Never upscales.
    pub fn fit_within(&self, max_side: u32) -> Resolution {
        let longest = self.longest_side();
        if longest == 0 || longest <= max_side {
            return *self;
        }
        let scale = max_side as f64 / longest as f64;
        let align = |side: u32| {
            let scaled = (side as f64 * scale).round() as u32;
            ((scaled / 8) * 8).max(8).min(side)
        };
        Resolution::new(align(self.width), align(self.height))
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Half-open range of frame indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRange {
    pub start: usize,
    pub end: usize,
}

impl FrameRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl Display for FrameRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Immutable packed RGB24 frame.
///
/// The pixel buffer is reference counted so frames can be handed to worker
/// tasks and several consumers without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    index: usize,
    resolution: Resolution,
    data: SharedBytes,
}

impl Frame {
    /// Bytes per pixel.
    pub const CHANNELS: usize = 3;

    /// Wraps packed RGB bytes, validating the buffer length.
    pub fn from_rgb(
        index: usize,
        resolution: Resolution,
        data: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        let expected = resolution.pixels() * Self::CHANNELS;
        if data.len() != expected {
            return Err(PipelineError::Mismatch(format!(
                "frame {index}: expected {expected} bytes for {resolution}, got {}",
                data.len()
            )));
        }
        Ok(Self {
            index,
            resolution,
            data: data.into(),
        })
    }

    /// Frame filled with a single color.
    pub fn solid(index: usize, resolution: Resolution, rgb: [u8; 3]) -> Self {
        let data: Vec<u8> = rgb
            .iter()
            .copied()
            .cycle()
            .take(resolution.pixels() * Self::CHANNELS)
            .collect();
        Self {
            index,
            resolution,
            data: data.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.resolution.width as usize + x as usize) * Self::CHANNELS;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    /// Returns the same pixels re-tagged with another frame index.
    pub fn with_index(&self, index: usize) -> Self {
        Self {
            index,
            resolution: self.resolution,
            data: self.data.clone(),
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame(index={}, {})", self.index, self.resolution)
    }
}

/// Per-pixel removal selector aligned with a [`Frame`].
///
/// Coverage is stored as 8 bits: 0 keeps the original pixel, 255 removes it,
/// anything in between is a soft selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskFrame {
    index: usize,
    resolution: Resolution,
    coverage: SharedBytes,
}

impl MaskFrame {
    pub const FULL: u8 = u8::MAX;

    pub fn from_coverage(
        index: usize,
        resolution: Resolution,
        coverage: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        if coverage.len() != resolution.pixels() {
            return Err(PipelineError::Mismatch(format!(
                "mask {index}: expected {} samples for {resolution}, got {}",
                resolution.pixels(),
                coverage.len()
            )));
        }
        Ok(Self {
            index,
            resolution,
            coverage: coverage.into(),
        })
    }

    /// Mask selecting nothing.
    pub fn empty(index: usize, resolution: Resolution) -> Self {
        Self {
            index,
            resolution,
            coverage: vec![0; resolution.pixels()].into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn coverage(&self) -> &[u8] {
        &self.coverage
    }

    /// Coverage at a pixel in `[0, 1]`.
    pub fn value(&self, x: u32, y: u32) -> f32 {
        self.coverage[y as usize * self.resolution.width as usize + x as usize] as f32 / 255.0
    }

    pub fn is_empty(&self) -> bool {
        self.coverage.iter().all(|&c| c == 0)
    }

    pub fn selected_pixels(&self) -> usize {
        self.coverage.iter().filter(|&&c| c > 0).count()
    }

    pub fn with_index(&self, index: usize) -> Self {
        Self {
            index,
            resolution: self.resolution,
            coverage: self.coverage.clone(),
        }
    }

    /// Thresholds soft coverage into a hard 0/255 selector.
    pub fn binarized(&self, threshold: f32) -> Self {
        let cut = (threshold.clamp(0.0, 1.0) * 255.0).round() as u8;
        let coverage: Vec<u8> = self
            .coverage
            .iter()
            .map(|&c| if c >= cut.max(1) { Self::FULL } else { 0 })
            .collect();
        Self {
            index: self.index,
            resolution: self.resolution,
            coverage: coverage.into(),
        }
    }

    /// Per-pixel maximum of two aligned masks.
    pub fn union(&self, other: &MaskFrame) -> Result<Self, PipelineError> {
        if self.resolution != other.resolution {
            return Err(PipelineError::Mismatch(format!(
                "cannot merge masks of {} and {}",
                self.resolution, other.resolution
            )));
        }
        let coverage: Vec<u8> = self
            .coverage
            .iter()
            .zip(other.coverage.iter())
            .map(|(a, b)| (*a).max(*b))
            .collect();
        Ok(Self {
            index: self.index,
            resolution: self.resolution,
            coverage: coverage.into(),
        })
    }

    /// Grows the selected region by `radius` pixels (square structuring element).
    /// Soft coverage keeps its values: each pixel takes the neighbourhood maximum.
    pub fn dilated(&self, radius: u32) -> Self {
        if radius == 0 || self.coverage.is_empty() {
            return self.clone();
        }
        let Some(image) = GrayImage::from_raw(
            self.resolution.width,
            self.resolution.height,
            self.coverage.to_vec(),
        ) else {
            return self.clone();
        };
        let element = Mask::square(radius.min(u8::MAX as u32) as u8);
        Self {
            index: self.index,
            resolution: self.resolution,
            coverage: grayscale_dilate(&image, &element).into_raw().into(),
        }
    }
}

/// Failure classes reported by inference collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceKind {
    Timeout,
    OutOfMemory,
    Model,
}

impl InferenceKind {
    /// Whether retrying the same work at a lower resolution may succeed.
    pub fn is_resource_bound(&self) -> bool {
        matches!(self, InferenceKind::Timeout | InferenceKind::OutOfMemory)
    }
}

impl Display for InferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InferenceKind::Timeout => "timeout",
            InferenceKind::OutOfMemory => "out of memory",
            InferenceKind::Model => "model failure",
        };
        f.write_str(label)
    }
}

/// Errors returned by the session and pipeline stages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("mask session busy: a mask generation is already in flight")]
    SessionBusy,
    #[error("inference {kind} on frames {range}{}: {message}", .resolution.map(|r| format!(" at {r}")).unwrap_or_default())]
    Inference {
        range: FrameRange,
        resolution: Option<Resolution>,
        kind: InferenceKind,
        message: String,
    },
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("missing mask: {0}")]
    MissingMask(String),
    #[error("sequence mismatch: {0}")]
    Mismatch(String),
    #[error("blend failure: {0}")]
    Blend(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("{} of {} chunks failed: {}", .0.failed.len(), .0.total(), .0.failed_ranges())]
    PartialFailure(ChunkReport),
    #[error("task join failure: {0}")]
    Join(String),
}

impl PipelineError {
    /// Process exit code distinguishing the error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Io(_) => 3,
            PipelineError::Inference { .. } | PipelineError::PartialFailure(_) => 4,
            PipelineError::MissingMask(_) => 5,
            PipelineError::InvalidPrompt(_) | PipelineError::SessionBusy => 6,
            PipelineError::Mismatch(_)
            | PipelineError::Blend(_)
            | PipelineError::Cancelled
            | PipelineError::Join(_) => 1,
        }
    }

    /// Frame range affected by the failure, when one is known.
    pub fn affected_range(&self) -> Option<FrameRange> {
        match self {
            PipelineError::Inference { range, .. } => Some(*range),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::Io(err.to_string())
    }
}

/// Executes the removal pipeline end-to-end with the built-in inference backends.
#[instrument(skip_all)]
pub async fn run(
    config: config::AppConfig,
    cancel: CancellationToken,
) -> Result<pipeline::RunSummary, PipelineError> {
    let telemetry = arc::telemetry::TelemetrySink::default();
    let coordinator = arc::coordinator::ArcCoordinator::new(
        telemetry.clone(),
        config.pipeline.inference.clone(),
    );
    let services = inference::InferenceServices::builtin(&config.pipeline);

    let result = pipeline::execute_pipeline(&config, &services, coordinator, cancel).await;
    services.shutdown().await;
    result
}
