//! Inpainting orchestrator: per-chunk resampling around one inference call.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    Frame, FrameRange, InferenceKind, MaskFrame, PipelineError, Resolution,
    arc::{coordinator::ArcCoordinator, telemetry::TelemetrySink},
    config::ResampleConfig, inference::Inpainter,
    mask::check_alignment,
};

use super::{
    chunk::Chunk,
    resample::{resize_frame, resize_mask},
};

/// Inpainted frames of one chunk at native resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub chunk: Chunk,
    /// Resolution the model actually ran at.
    pub inference_resolution: Resolution,
    frames: Arc<[Frame]>,
}

impl ChunkResult {
    pub fn new(chunk: Chunk, inference_resolution: Resolution, frames: Vec<Frame>) -> Self {
        Self {
            chunk,
            inference_resolution,
            frames: frames.into(),
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frame for an absolute index inside the chunk's range.
    pub fn frame(&self, index: usize) -> Option<&Frame> {
        index
            .checked_sub(self.chunk.start())
            .and_then(|offset| self.frames.get(offset))
    }
}

/// A chunk that failed, with the error that stopped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk: Chunk,
    pub error: PipelineError,
}

/// Which chunk ranges succeeded, failed, or were never dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkReport {
    pub succeeded: Vec<FrameRange>,
    pub failed: Vec<ChunkFailure>,
    pub skipped: Vec<FrameRange>,
}

impl ChunkReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn failed_ranges(&self) -> String {
        self.failed
            .iter()
            .map(|failure| failure.chunk.range.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Results of running a whole plan, ordered by chunk.
#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub results: Vec<ChunkResult>,
    pub report: ChunkReport,
    pub cancelled: bool,
}

/// Drives one inference call per chunk through the resource coordinator.
#[derive(Clone)]
pub struct InpaintOrchestrator {
    inpainter: Arc<dyn Inpainter>,
    coordinator: ArcCoordinator,
    resample: ResampleConfig,
    timeout: Duration,
    workers: usize,
}

impl InpaintOrchestrator {
    pub fn new(
        inpainter: Arc<dyn Inpainter>,
        coordinator: ArcCoordinator,
        resample: ResampleConfig,
        timeout: Duration,
    ) -> Self {
        let workers = coordinator.slots();
        Self {
            inpainter,
            coordinator,
            resample,
            timeout,
            workers,
        }
    }

    /// Upper bound on chunks being prepared or inferred at once.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn coordinator(&self) -> &ArcCoordinator {
        &self.coordinator
    }

    /// Downscales, inpaints and upscales a single chunk.
    ///
    /// `frames` and `masks` hold exactly the chunk's frames. Failures are tagged
    /// with the chunk range and the attempted resolution so a caller can retry
    /// the chunk at a smaller `max_side`.
    #[instrument(skip_all, fields(chunk = chunk.index, range = %chunk.range, max_side))]
    pub async fn process_chunk(
        &self,
        chunk: Chunk,
        frames: &[Frame],
        masks: &[MaskFrame],
        max_side: u32,
    ) -> Result<ChunkResult, PipelineError> {
        if frames.len() != chunk.len() {
            return Err(PipelineError::Mismatch(format!(
                "{chunk} received {} frames",
                frames.len()
            )));
        }
        check_alignment(frames, masks)?;
        let Some(native) = frames.first().map(Frame::resolution) else {
            return Ok(ChunkResult::new(chunk, Resolution::new(0, 0), Vec::new()));
        };
        let target = native.fit_within(max_side);
        let telemetry = self.coordinator.telemetry();

        let (small_frames, small_masks) = {
            let frames = frames.to_vec();
            let masks = masks.to_vec();
            let resample = self.resample.clone();
            tokio::task::spawn_blocking(move || downscale(&frames, &masks, target, &resample))
                .await??
        };
        telemetry.record_stage("downscale", chunk.range);

        let permit = self.coordinator.acquire(chunk.range, target).await?;
        telemetry.record_stage("inpaint", chunk.range);
        let inferred = tokio::time::timeout(
            self.timeout,
            self.inpainter.inpaint(&small_frames, &small_masks),
        )
        .await;
        drop(permit);

        let inference_error = |kind: InferenceKind, message: String| PipelineError::Inference {
            range: chunk.range,
            resolution: Some(target),
            kind,
            message,
        };
        let inpainted = match inferred {
            Err(_) => {
                return Err(inference_error(
                    InferenceKind::Timeout,
                    format!("no result within {:?}", self.timeout),
                ));
            }
            Ok(Err(fault)) => return Err(inference_error(fault.kind, fault.message)),
            Ok(Ok(inpainted)) => inpainted,
        };
        if inpainted.len() != small_frames.len() {
            return Err(inference_error(
                InferenceKind::Model,
                format!(
                    "model returned {} frames for {}",
                    inpainted.len(),
                    small_frames.len()
                ),
            ));
        }
        if let Some(odd) = inpainted.iter().find(|f| f.resolution() != target) {
            return Err(inference_error(
                InferenceKind::Model,
                format!("model returned a {} frame, expected {target}", odd.resolution()),
            ));
        }

        let indices: Vec<usize> = frames.iter().map(Frame::index).collect();
        let filter = self.resample.upscale;
        let restored = tokio::task::spawn_blocking(move || {
            inpainted
                .iter()
                .zip(indices)
                .map(|(frame, index)| {
                    resize_frame(frame, native, filter).map(|resized| resized.with_index(index))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await??;
        telemetry.record_stage("upscale", chunk.range);

        Ok(ChunkResult::new(chunk, target, restored))
    }

    /// Runs every chunk of `plan`, at most `workers` at a time.
    ///
    /// A failing chunk does not stop the others. Cancellation is observed
    /// before each dispatch; chunks already in flight are allowed to finish.
    #[instrument(skip_all, fields(chunks = plan.len(), max_side))]
    pub async fn process_plan(
        &self,
        plan: &[Chunk],
        frames: Arc<[Frame]>,
        masks: Arc<[MaskFrame]>,
        max_side: u32,
        cancel: &CancellationToken,
    ) -> PlanOutcome {
        let telemetry = self.coordinator.telemetry();
        let mut in_flight = JoinSet::new();
        let mut completed: BTreeMap<usize, ChunkResult> = BTreeMap::new();
        let mut pending: BTreeMap<usize, Chunk> = BTreeMap::new();
        let mut report = ChunkReport::default();
        let mut cancelled = false;

        for (position, chunk) in plan.iter().enumerate() {
            while in_flight.len() >= self.workers {
                if let Some(joined) = in_flight.join_next().await {
                    collect(joined, &mut pending, &mut completed, &mut report, &telemetry);
                }
            }
            if cancel.is_cancelled() {
                warn!(target = "pipeline", chunk = chunk.index, "cancelled before dispatch");
                report
                    .skipped
                    .extend(plan[position..].iter().map(|c| c.range));
                cancelled = true;
                break;
            }

            telemetry.record_dispatch(chunk.range);
            pending.insert(chunk.index, *chunk);
            let worker = self.clone();
            let chunk = *chunk;
            let frames = frames.clone();
            let masks = masks.clone();
            let cancel = cancel.clone();
            in_flight.spawn(async move {
                let outcome = if cancel.is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else {
                    let range = chunk.range.indices();
                    match (frames.get(range.clone()), masks.get(range)) {
                        (Some(f), Some(m)) => worker.process_chunk(chunk, f, m, max_side).await,
                        _ => Err(PipelineError::Mismatch(format!(
                            "{chunk} exceeds {} frames",
                            frames.len()
                        ))),
                    }
                };
                (chunk, outcome)
            });
        }
        while let Some(joined) = in_flight.join_next().await {
            collect(joined, &mut pending, &mut completed, &mut report, &telemetry);
        }
        // Whatever is still pending belonged to a task that panicked.
        for chunk in pending.into_values() {
            report.failed.push(ChunkFailure {
                chunk,
                error: PipelineError::Join(format!("{chunk} worker aborted")),
            });
        }

        report.succeeded.sort();
        report.failed.sort_by_key(|failure| failure.chunk.index);
        info!(
            target = "pipeline",
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "plan processed"
        );
        PlanOutcome {
            results: completed.into_values().collect(),
            report,
            cancelled,
        }
    }
}

fn collect(
    joined: Result<(Chunk, Result<ChunkResult, PipelineError>), tokio::task::JoinError>,
    pending: &mut BTreeMap<usize, Chunk>,
    completed: &mut BTreeMap<usize, ChunkResult>,
    report: &mut ChunkReport,
    telemetry: &TelemetrySink,
) {
    match joined {
        Ok((chunk, Ok(result))) => {
            pending.remove(&chunk.index);
            telemetry.record_chunk_outcome(true);
            report.succeeded.push(chunk.range);
            completed.insert(chunk.index, result);
        }
        Ok((chunk, Err(error))) => {
            pending.remove(&chunk.index);
            warn!(target = "pipeline", range = %chunk.range, error = %error, "chunk failed");
            telemetry.record_chunk_outcome(false);
            report.failed.push(ChunkFailure { chunk, error });
        }
        Err(join_error) => {
            warn!(target = "pipeline", error = %join_error, "chunk task aborted");
            telemetry.record_chunk_outcome(false);
        }
    }
}

fn downscale(
    frames: &[Frame],
    masks: &[MaskFrame],
    target: Resolution,
    resample: &ResampleConfig,
) -> Result<(Vec<Frame>, Vec<MaskFrame>), PipelineError> {
    let small_frames = frames
        .iter()
        .map(|frame| resize_frame(frame, target, resample.color))
        .collect::<Result<Vec<_>, _>>()?;
    let small_masks = masks
        .iter()
        .map(|mask| resize_mask(mask, target, resample.mask))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((small_frames, small_masks))
}
