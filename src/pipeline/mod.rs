//! Pipeline orchestration: source, masks, chunked inpainting, blending,
//! compositing and sink.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    Frame, FrameRange, MaskFrame, PipelineError,
    arc::{coordinator::ArcCoordinator, telemetry::TelemetrySnapshot},
    config::{AppConfig, FrameWindow, IoConfig},
    inference::{InferenceFault, InferenceServices},
    mask::{
        AnnotationDocument, MaskSession, check_alignment, frames_from_masks, masks_from_frames,
        prepare_mask,
    },
};

pub mod blend;
pub mod chunk;
pub mod composite;
pub mod decode;
pub mod encode;
pub mod inpaint;
pub mod resample;

pub use blend::{BlendedSequence, OverlapBlender};
pub use chunk::{Chunk, plan_chunks};
pub use composite::Compositor;
pub use decode::{FrameSource, VideoInfo};
pub use encode::FrameSink;
pub use inpaint::{ChunkFailure, ChunkReport, ChunkResult, InpaintOrchestrator, PlanOutcome};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames: usize,
    pub chunks: usize,
    pub retries: usize,
    pub fps: f64,
    pub output_path: PathBuf,
    pub telemetry: TelemetrySnapshot,
}

/// Runs the whole removal pipeline for one video.
#[instrument(skip_all, fields(input = %config.color_video.display()))]
pub async fn execute_pipeline(
    config: &AppConfig,
    services: &InferenceServices,
    coordinator: ArcCoordinator,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineError> {
    if config.mask_video.is_none() && config.annotations.is_none() {
        return Err(PipelineError::MissingMask(
            "pass --mask-video or --annotations".to_string(),
        ));
    }
    let pipeline = &config.pipeline;
    let telemetry = coordinator.telemetry();

    let (frames, info) = read_source(config.color_video.clone(), config.window, pipeline.io.fps).await?;
    let fps = if info.fps > 0.0 { info.fps } else { pipeline.io.fps };
    let frames: Arc<[Frame]> = frames.into();
    telemetry.record_stage("decode", FrameRange::new(0, frames.len()));
    info!(
        target = "pipeline",
        frames = frames.len(),
        resolution = %info.resolution,
        fps,
        "source opened"
    );

    let masks: Arc<[MaskFrame]> = load_masks(config, services, &frames, fps).await?.into();
    check_alignment(&frames, &masks)?;

    let plan = plan_chunks(
        frames.len(),
        pipeline.chunking.chunk_len,
        pipeline.chunking.overlap,
    )?;
    let whole = FrameRange::new(0, frames.len());
    let inpainter = services
        .inpainter
        .get()
        .await
        .map_err(|fault| service_error(whole, fault))?;
    let orchestrator = InpaintOrchestrator::new(
        inpainter,
        coordinator,
        pipeline.resample.clone(),
        Duration::from_secs(pipeline.inference.timeout_secs),
    )
    .with_workers(pipeline.inference.workers);

    let max_side = pipeline.inference.max_resolution;
    let mut outcome = orchestrator
        .process_plan(&plan, frames.clone(), masks.clone(), max_side, &cancel)
        .await;
    if outcome.cancelled {
        return Err(PipelineError::Cancelled);
    }
    let retries = retry_resource_failures(
        &orchestrator,
        &mut outcome,
        &frames,
        &masks,
        max_side,
        pipeline.inference.min_resolution,
        &cancel,
    )
    .await;
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    if !outcome.report.is_complete() {
        return Err(PipelineError::PartialFailure(outcome.report));
    }

    let blender = OverlapBlender::new(&pipeline.blend);
    let compositor = Compositor::new(&pipeline.composite);
    let results = outcome.results;
    let (originals, mattes) = (frames.clone(), masks.clone());
    let composited = tokio::task::spawn_blocking(move || {
        let blended = blender.blend_with_originals(results, &originals, &mattes)?;
        let composited = compositor.composite(&originals, &blended, &mattes)?;
        Ok::<_, PipelineError>((blended.len(), composited))
    })
    .await?;
    let (blended, composited) = composited?;
    telemetry.record_blended(blended);
    telemetry.record_composited(composited.len());

    let output_path = config.output_path.clone();
    let frame_count = composited.len();
    write_sequence(output_path.clone(), composited, fps).await?;
    telemetry.record_stage("encode", whole);
    info!(
        target = "pipeline",
        frames = frame_count,
        chunks = plan.len(),
        retries,
        output = %output_path.display(),
        "run complete"
    );

    Ok(RunSummary {
        frames: frame_count,
        chunks: plan.len(),
        retries,
        fps,
        output_path,
        telemetry: telemetry.snapshot(),
    })
}

/// Resubmits chunks that failed for lack of resources, halving the inference
/// resolution each time until it would drop below `min_side`.
///
/// Only the failed chunk is rerun. Recovered chunks move into the outcome's
/// results and succeeded ranges; the rest stay failed with their last error.
/// Returns the number of resubmissions.
#[instrument(skip_all, fields(failed = outcome.report.failed.len(), max_side, min_side))]
pub async fn retry_resource_failures(
    orchestrator: &InpaintOrchestrator,
    outcome: &mut PlanOutcome,
    frames: &[Frame],
    masks: &[MaskFrame],
    max_side: u32,
    min_side: u32,
    cancel: &CancellationToken,
) -> usize {
    let telemetry = orchestrator.coordinator().telemetry();
    let mut retries = 0;
    let failed = std::mem::take(&mut outcome.report.failed);
    for ChunkFailure { chunk, mut error } in failed {
        let mut side = match &error {
            PipelineError::Inference {
                resolution: Some(resolution),
                ..
            } => resolution.longest_side(),
            _ => max_side,
        };
        let mut recovered = None;
        loop {
            let resource_bound = matches!(
                &error,
                PipelineError::Inference { kind, .. } if kind.is_resource_bound()
            );
            let next_side = side / 2;
            if !resource_bound || next_side < min_side || cancel.is_cancelled() {
                break;
            }
            side = next_side;
            retries += 1;
            telemetry.record_retry(chunk.range);
            warn!(target = "pipeline", range = %chunk.range, max_side = side, "retrying chunk at lower resolution");

            let range = chunk.range.indices();
            let attempt = match (frames.get(range.clone()), masks.get(range)) {
                (Some(f), Some(m)) => orchestrator.process_chunk(chunk, f, m, side).await,
                _ => Err(PipelineError::Mismatch(format!(
                    "{chunk} exceeds {} frames",
                    frames.len()
                ))),
            };
            match attempt {
                Ok(result) => {
                    recovered = Some(result);
                    break;
                }
                Err(next) => error = next,
            }
        }

        match recovered {
            Some(result) => {
                telemetry.record_chunk_outcome(true);
                outcome.report.succeeded.push(chunk.range);
                outcome.results.push(result);
            }
            None => outcome.report.failed.push(ChunkFailure { chunk, error }),
        }
    }
    outcome.report.succeeded.sort();
    outcome.results.sort_by_key(|result| result.chunk.index);
    retries
}

async fn read_source(
    path: PathBuf,
    window: FrameWindow,
    fps: f64,
) -> Result<(Vec<Frame>, VideoInfo), PipelineError> {
    tokio::task::spawn_blocking(move || {
        let mut source = decode::open_source(&path, window, fps)?;
        let info = source.info();
        Ok::<_, PipelineError>((source.read_all()?, info))
    })
    .await?
}

/// Masks from a mask video when given, otherwise from annotation prompts run
/// through a mask session.
async fn load_masks(
    config: &AppConfig,
    services: &InferenceServices,
    frames: &Arc<[Frame]>,
    fps: f64,
) -> Result<Vec<MaskFrame>, PipelineError> {
    let io: IoConfig = config.pipeline.io.clone();
    if let Some(path) = &config.mask_video {
        let (mask_frames, _) = read_source(path.clone(), config.window, fps).await?;
        return tokio::task::spawn_blocking(move || masks_from_frames(&mask_frames, &io)).await?;
    }
    let Some(path) = &config.annotations else {
        return Err(PipelineError::MissingMask(
            "pass --mask-video or --annotations".to_string(),
        ));
    };

    let document = AnnotationDocument::load(path).await?;
    let whole = FrameRange::new(0, frames.len());
    let segmenter = services
        .segmenter
        .get()
        .await
        .map_err(|fault| service_error(whole, fault))?;
    let session = MaskSession::new(frames.clone(), segmenter)?;
    let added = document.apply(&session, fps, config.window.start)?;
    info!(target = "pipeline", prompts = added, "annotations loaded");
    session.generate().await?;
    let masks = session.finalize()?;
    if let Some(path) = &config.mask_output {
        let rendered = frames_from_masks(&masks)?;
        write_sequence(path.clone(), rendered, fps).await?;
    }
    Ok(masks.into_iter().map(|mask| prepare_mask(mask, &io)).collect())
}

async fn write_sequence(path: PathBuf, frames: Vec<Frame>, fps: f64) -> Result<(), PipelineError> {
    tokio::task::spawn_blocking(move || {
        let mut sink = encode::open_sink(&path)?;
        sink.write(&frames, fps)?;
        info!(
            target = "pipeline",
            frames = frames.len(),
            path = %sink.path().display(),
            "sequence written"
        );
        Ok::<_, PipelineError>(())
    })
    .await?
}

fn service_error(range: FrameRange, fault: InferenceFault) -> PipelineError {
    PipelineError::Inference {
        range,
        resolution: None,
        kind: fault.kind,
        message: fault.message,
    }
}
