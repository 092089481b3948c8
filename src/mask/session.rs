//! Interactive mask authoring session.
//!
//! Prompt edits are cheap in-memory operations; [`MaskSession::generate`] is the
//! only call that reaches the segmentation backend. The session is a cloneable
//! handle so a UI can keep editing from one task while another awaits a
//! generation. Any mutation attempted while a generation is in flight is
//! rejected with [`PipelineError::SessionBusy`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, info, instrument, warn};

use crate::{
    Frame, FrameRange, MaskFrame, PipelineError, Resolution,
    inference::{InferenceFault, Segmenter},
};

use super::prompt::{Polarity, Prompt, Rect};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PromptsPending,
    MaskGenerating,
    MaskReady,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    prompts: Vec<Prompt>,
    masks: Option<Arc<[MaskFrame]>>,
}

/// Turns point and box prompts into one mask per frame.
#[derive(Clone)]
pub struct MaskSession {
    frames: Arc<[Frame]>,
    resolution: Resolution,
    segmenter: Arc<dyn Segmenter>,
    inner: Arc<Mutex<SessionInner>>,
}

impl MaskSession {
    pub fn new(
        frames: impl Into<Arc<[Frame]>>,
        segmenter: Arc<dyn Segmenter>,
    ) -> Result<Self, PipelineError> {
        let frames: Arc<[Frame]> = frames.into();
        let resolution = frames
            .first()
            .map(Frame::resolution)
            .ok_or_else(|| PipelineError::Mismatch("mask session needs frames".to_string()))?;
        if let Some(odd) = frames.iter().find(|f| f.resolution() != resolution) {
            return Err(PipelineError::Mismatch(format!(
                "frame {} is {}, expected {resolution}",
                odd.index(),
                odd.resolution()
            )));
        }
        Ok(Self {
            frames,
            resolution,
            segmenter,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Idle,
                prompts: Vec::new(),
                masks: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `edit` unless a generation is in flight.
    fn mutate<R>(
        &self,
        edit: impl FnOnce(&mut SessionInner) -> Result<R, PipelineError>,
    ) -> Result<R, PipelineError> {
        let mut inner = self.lock();
        if inner.state == SessionState::MaskGenerating {
            return Err(PipelineError::SessionBusy);
        }
        edit(&mut inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.lock().prompts.clone()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Latest generated mask sequence, if the session is ready.
    pub fn masks(&self) -> Option<Arc<[MaskFrame]>> {
        let inner = self.lock();
        match inner.state {
            SessionState::MaskReady => inner.masks.clone(),
            _ => None,
        }
    }

    pub fn add_point(
        &self,
        frame_index: usize,
        x: f32,
        y: f32,
        polarity: Polarity,
    ) -> Result<(), PipelineError> {
        self.add(Prompt::point(frame_index, x, y, polarity))
    }

    pub fn add_box(&self, frame_index: usize, rect: Rect) -> Result<(), PipelineError> {
        self.add(Prompt::rect(frame_index, rect))
    }

    /// Appends a prompt after validating it against the video bounds.
    pub fn add(&self, prompt: Prompt) -> Result<(), PipelineError> {
        self.mutate(|inner| {
            prompt.validate(self.frames.len(), self.resolution)?;
            debug!(target = "mask", prompt = %prompt, "prompt added");
            inner.prompts.push(prompt);
            inner.state = SessionState::PromptsPending;
            Ok(())
        })
    }

    /// Appends a batch of prompts. Nothing is added unless every prompt is valid.
    pub fn add_all(&self, prompts: &[Prompt]) -> Result<(), PipelineError> {
        self.mutate(|inner| {
            for prompt in prompts {
                prompt.validate(self.frames.len(), self.resolution)?;
            }
            if prompts.is_empty() {
                return Ok(());
            }
            inner.prompts.extend_from_slice(prompts);
            inner.state = SessionState::PromptsPending;
            debug!(target = "mask", prompts = prompts.len(), "prompts added");
            Ok(())
        })
    }

    /// Undoes the most recent prompt. Returns it, or `None` when there was none.
    pub fn remove_last(&self) -> Result<Option<Prompt>, PipelineError> {
        self.mutate(|inner| {
            let removed = inner.prompts.pop();
            if removed.is_some() {
                inner.state = if inner.prompts.is_empty() {
                    SessionState::Idle
                } else {
                    SessionState::PromptsPending
                };
            }
            Ok(removed)
        })
    }

    /// Drops all prompts and masks.
    pub fn clear(&self) -> Result<(), PipelineError> {
        self.mutate(|inner| {
            inner.prompts.clear();
            inner.masks = None;
            inner.state = SessionState::Idle;
            Ok(())
        })
    }

    /// Segments every prompted frame, propagates each result over the whole
    /// video and merges them into one mask per frame.
    #[instrument(skip_all, fields(frames = self.frames.len()))]
    pub async fn generate(&self) -> Result<Arc<[MaskFrame]>, PipelineError> {
        let prompts = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::MaskGenerating => return Err(PipelineError::SessionBusy),
                SessionState::Idle => {
                    return Err(PipelineError::InvalidPrompt(
                        "no prompts to generate a mask from".to_string(),
                    ));
                }
                SessionState::MaskReady => {
                    if let Some(masks) = inner.masks.clone() {
                        return Ok(masks);
                    }
                }
                SessionState::PromptsPending => {}
            }
            inner.state = SessionState::MaskGenerating;
            inner.prompts.clone()
        };

        let mut guard = GenerationGuard {
            inner: &self.inner,
            settled: false,
        };
        info!(target = "mask", prompts = prompts.len(), "generating mask");
        match self.segment_and_propagate(&prompts).await {
            Ok(masks) => {
                let masks: Arc<[MaskFrame]> = masks.into();
                guard.settle(SessionState::MaskReady, Some(masks.clone()));
                Ok(masks)
            }
            Err(error) => {
                warn!(target = "mask", error = %error, "mask generation failed");
                guard.settle(SessionState::PromptsPending, None);
                Err(error)
            }
        }
    }

    /// Ends the session, handing out the generated masks.
    pub fn finalize(self) -> Result<Vec<MaskFrame>, PipelineError> {
        let inner = self.lock();
        match (inner.state, inner.masks.as_ref()) {
            (SessionState::MaskGenerating, _) => Err(PipelineError::SessionBusy),
            (SessionState::MaskReady, Some(masks)) => Ok(masks.to_vec()),
            _ => Err(PipelineError::MissingMask(
                "session has no generated mask".to_string(),
            )),
        }
    }

    async fn segment_and_propagate(
        &self,
        prompts: &[Prompt],
    ) -> Result<Vec<MaskFrame>, PipelineError> {
        let mut by_frame: BTreeMap<usize, Vec<Prompt>> = BTreeMap::new();
        for prompt in prompts {
            by_frame.entry(prompt.frame_index).or_default().push(*prompt);
        }

        let full = FrameRange::new(0, self.frames.len());
        let mut merged: Option<Vec<MaskFrame>> = None;
        for (reference_index, frame_prompts) in by_frame {
            let reference = &self.frames[reference_index];
            let seed = self
                .segmenter
                .segment(reference, &frame_prompts)
                .await
                .map_err(|fault| {
                    self.tag(fault, FrameRange::new(reference_index, reference_index + 1))
                })?;
            self.check_mask(&seed)?;

            let propagated = self
                .segmenter
                .propagate(&seed, reference_index, &self.frames)
                .await
                .map_err(|fault| self.tag(fault, full))?;
            if propagated.len() != self.frames.len() {
                return Err(PipelineError::Mismatch(format!(
                    "propagation returned {} masks for {} frames",
                    propagated.len(),
                    self.frames.len()
                )));
            }
            for mask in &propagated {
                self.check_mask(mask)?;
            }

            merged = Some(match merged {
                None => propagated,
                Some(previous) => previous
                    .iter()
                    .zip(propagated.iter())
                    .map(|(a, b)| a.union(b))
                    .collect::<Result<Vec<_>, _>>()?,
            });
        }

        let merged = merged.unwrap_or_default();
        Ok(merged
            .into_iter()
            .zip(self.frames.iter())
            .map(|(mask, frame)| mask.with_index(frame.index()))
            .collect())
    }

    fn check_mask(&self, mask: &MaskFrame) -> Result<(), PipelineError> {
        if mask.resolution() != self.resolution {
            return Err(PipelineError::Mismatch(format!(
                "segmenter returned a {} mask for {} frames",
                mask.resolution(),
                self.resolution
            )));
        }
        Ok(())
    }

    fn tag(&self, fault: InferenceFault, range: FrameRange) -> PipelineError {
        PipelineError::Inference {
            range,
            resolution: Some(self.resolution),
            kind: fault.kind,
            message: fault.message,
        }
    }
}

/// Restores a settled state even when the generating future is dropped.
struct GenerationGuard<'a> {
    inner: &'a Mutex<SessionInner>,
    settled: bool,
}

impl GenerationGuard<'_> {
    fn settle(&mut self, state: SessionState, masks: Option<Arc<[MaskFrame]>>) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.state = state;
        if masks.is_some() {
            inner.masks = masks;
        }
        self.settled = true;
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(SessionState::PromptsPending, None);
        }
    }
}
