//! Inference collaborators and the lazily initialised service handles that own them.
//!
//! Segmentation and inpainting models are black boxes to the pipeline. They are
//! reached through the [`Segmenter`] and [`Inpainter`] traits and owned by an
//! [`InferenceService`], which loads the backend on first use and drops it on
//! [`InferenceService::shutdown`] so accelerator memory is released explicitly.

pub mod region_grow;
pub mod temporal_fill;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Frame, InferenceKind, MaskFrame, config::PipelineConfig, mask::prompt::Prompt};

pub use region_grow::RegionGrowSegmenter;
pub use temporal_fill::TemporalFillInpainter;

/// Failure reported by an inference backend, before the pipeline tags it with a frame range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct InferenceFault {
    pub kind: InferenceKind,
    pub message: String,
}

impl InferenceFault {
    pub fn new(kind: InferenceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(InferenceKind::Model, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(InferenceKind::OutOfMemory, message)
    }
}

impl From<tokio::task::JoinError> for InferenceFault {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::model(format!("inference task failed: {err}"))
    }
}

/// Video inpainting model consuming whole frame sequences.
#[async_trait]
pub trait Inpainter: Send + Sync {
    /// Returns one frame per input frame, at the input resolution.
    async fn inpaint(
        &self,
        frames: &[Frame],
        masks: &[MaskFrame],
    ) -> Result<Vec<Frame>, InferenceFault>;
}

/// Promptable segmentation model with temporal propagation.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Produces a mask for the reference frame from the prompts issued on it.
    async fn segment(
        &self,
        reference: &Frame,
        prompts: &[Prompt],
    ) -> Result<MaskFrame, InferenceFault>;

    /// Spreads a single-frame mask across the whole sequence.
    async fn propagate(
        &self,
        mask: &MaskFrame,
        reference_index: usize,
        frames: &[Frame],
    ) -> Result<Vec<MaskFrame>, InferenceFault>;
}

/// Explicitly owned handle around a lazily loaded backend.
pub struct InferenceService<T: ?Sized> {
    name: &'static str,
    loader: Box<dyn Fn() -> Result<Arc<T>, InferenceFault> + Send + Sync>,
    backend: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized + Send + Sync> InferenceService<T> {
    pub fn lazy<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<T>, InferenceFault> + Send + Sync + 'static,
    {
        Self {
            name,
            loader: Box::new(loader),
            backend: Mutex::new(None),
        }
    }

    /// Wraps an already constructed backend. It cannot be reloaded after shutdown.
    pub fn ready(name: &'static str, backend: Arc<T>) -> Self {
        Self {
            name,
            loader: Box::new(move || {
                Err(InferenceFault::model(format!("{name} backend was shut down")))
            }),
            backend: Mutex::new(Some(backend)),
        }
    }

    /// Loads the backend on first use and returns a shared handle to it.
    pub async fn get(&self) -> Result<Arc<T>, InferenceFault> {
        let mut guard = self.backend.lock().await;
        if let Some(backend) = guard.as_ref() {
            return Ok(backend.clone());
        }
        info!(target = "inference", service = self.name, "loading backend");
        let backend = (self.loader)()?;
        *guard = Some(backend.clone());
        Ok(backend)
    }

    pub async fn is_loaded(&self) -> bool {
        self.backend.lock().await.is_some()
    }

    /// Drops the service's reference to the backend. A later `get` reloads it.
    pub async fn shutdown(&self) {
        if self.backend.lock().await.take().is_some() {
            debug!(target = "inference", service = self.name, "backend released");
        }
    }
}

/// The pair of services a pipeline run needs.
pub struct InferenceServices {
    pub inpainter: InferenceService<dyn Inpainter>,
    pub segmenter: InferenceService<dyn Segmenter>,
}

impl InferenceServices {
    /// CPU backends that need no model weights.
    pub fn builtin(config: &PipelineConfig) -> Self {
        let tolerance = config.segmentation.color_tolerance;
        Self {
            inpainter: InferenceService::lazy("temporal-fill", || {
                Ok(Arc::new(TemporalFillInpainter::default()) as Arc<dyn Inpainter>)
            }),
            segmenter: InferenceService::lazy("region-grow", move || {
                Ok(Arc::new(RegionGrowSegmenter::new(tolerance)) as Arc<dyn Segmenter>)
            }),
        }
    }

    pub fn from_backends(inpainter: Arc<dyn Inpainter>, segmenter: Arc<dyn Segmenter>) -> Self {
        Self {
            inpainter: InferenceService::ready("inpainter", inpainter),
            segmenter: InferenceService::ready("segmenter", segmenter),
        }
    }

    pub async fn shutdown(&self) {
        self.inpainter.shutdown().await;
        self.segmenter.shutdown().await;
    }
}
