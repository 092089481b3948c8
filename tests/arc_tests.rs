use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use vanish::{
    Frame, FrameRange, InferenceKind, MaskFrame, PipelineError, Resolution,
    arc::{coordinator::ArcCoordinator, estimator::ResourceEstimator, policy, telemetry::TelemetrySink},
    config::{InferenceConfig, ResampleConfig},
    inference::{InferenceFault, InferenceService, Inpainter, TemporalFillInpainter},
    pipeline::{InpaintOrchestrator, plan_chunks},
};

fn budgeted(memory_mb: f32, workers: usize, devices: usize, partitioned: bool) -> InferenceConfig {
    InferenceConfig {
        workers,
        devices,
        partition_device_memory: partitioned,
        device_memory_mb: memory_mb,
        ..InferenceConfig::default()
    }
}

#[test]
fn policy_allows_under_budget() {
    let estimate = ResourceEstimator::default().estimate(10, Resolution::new(100, 100));
    let decision = policy::evaluate(&budgeted(8.0, 1, 1, false), &estimate);
    assert!(decision.allowed);
    assert!(policy::evaluate(&budgeted(0.0, 1, 1, false), &estimate).allowed);
}

#[test]
fn partitioned_budget_is_shared_per_device() {
    // 10 frames of 100x100 at 64 bytes per pixel is about 6.1 MiB.
    let estimate = ResourceEstimator::default().estimate(10, Resolution::new(100, 100));
    let decision = policy::evaluate(&budgeted(8.0, 4, 2, true), &estimate);
    assert!(!decision.allowed);
    assert!(decision.reason.expect("reason").contains("MiB"));
}

#[test]
fn slots_follow_the_device_layout() {
    let telemetry = TelemetrySink::default();
    assert_eq!(ArcCoordinator::new(telemetry.clone(), budgeted(0.0, 4, 2, false)).slots(), 2);
    assert_eq!(ArcCoordinator::new(telemetry.clone(), budgeted(0.0, 4, 2, true)).slots(), 4);
    assert_eq!(ArcCoordinator::new(telemetry, budgeted(0.0, 1, 3, false)).slots(), 1);
}

#[tokio::test]
async fn over_budget_chunk_fails_as_out_of_memory() {
    let coordinator = ArcCoordinator::new(TelemetrySink::default(), budgeted(1.0, 1, 1, false));
    let range = FrameRange::new(20, 70);
    let resolution = Resolution::new(960, 544);

    let err = coordinator
        .acquire(range, resolution)
        .await
        .err()
        .expect("over budget");
    assert_eq!(err.affected_range(), Some(range));
    match err {
        PipelineError::Inference {
            kind,
            resolution: attempted,
            ..
        } => {
            assert_eq!(kind, InferenceKind::OutOfMemory);
            assert_eq!(attempted, Some(resolution));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(coordinator.active_jobs(), 0);
}

#[tokio::test]
async fn permits_release_their_slot_on_drop() {
    let coordinator = ArcCoordinator::new(TelemetrySink::default(), budgeted(0.0, 2, 2, false));
    let first = coordinator
        .acquire(FrameRange::new(0, 4), Resolution::new(8, 8))
        .await
        .expect("slot");
    assert_eq!(first.estimate().frames, 4);
    let second = coordinator
        .acquire(FrameRange::new(4, 8), Resolution::new(8, 8))
        .await
        .expect("slot");
    assert_eq!(coordinator.active_jobs(), 2);
    drop(first);
    drop(second);
    assert_eq!(coordinator.active_jobs(), 0);
}

struct CountingInpainter {
    calls: AtomicUsize,
}

#[async_trait]
impl Inpainter for CountingInpainter {
    async fn inpaint(&self, frames: &[Frame], _masks: &[MaskFrame]) -> Result<Vec<Frame>, InferenceFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(frames.to_vec())
    }
}

struct StalledInpainter;

#[async_trait]
impl Inpainter for StalledInpainter {
    async fn inpaint(&self, frames: &[Frame], _masks: &[MaskFrame]) -> Result<Vec<Frame>, InferenceFault> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(frames.to_vec())
    }
}

fn chunk_inputs(len: usize, resolution: Resolution) -> (Vec<Frame>, Vec<MaskFrame>) {
    let frames = (0..len).map(|i| Frame::solid(i, resolution, [90; 3])).collect();
    let masks = (0..len)
        .map(|i| MaskFrame::from_coverage(i, resolution, vec![MaskFrame::FULL; resolution.pixels()]).expect("mask"))
        .collect();
    (frames, masks)
}

#[tokio::test]
async fn memory_gate_runs_before_inference() {
    let inpainter = Arc::new(CountingInpainter {
        calls: AtomicUsize::new(0),
    });
    let coordinator = ArcCoordinator::new(TelemetrySink::default(), budgeted(2.0, 1, 1, false));
    let orchestrator = InpaintOrchestrator::new(
        inpainter.clone(),
        coordinator,
        ResampleConfig::default(),
        Duration::from_secs(5),
    );
    let plan = plan_chunks(6, 6, 0).expect("plan");
    let (frames, masks) = chunk_inputs(6, Resolution::new(256, 256));

    let err = orchestrator
        .process_chunk(plan[0], &frames, &masks, 256)
        .await
        .expect_err("over budget");
    assert!(matches!(
        err,
        PipelineError::Inference {
            kind: InferenceKind::OutOfMemory,
            ..
        }
    ));
    assert_eq!(inpainter.calls.load(Ordering::SeqCst), 0);

    // Halving the side quarters the estimate and the chunk fits.
    let result = orchestrator
        .process_chunk(plan[0], &frames, &masks, 64)
        .await
        .expect("fits at lower resolution");
    assert_eq!(result.inference_resolution, Resolution::new(64, 64));
    assert_eq!(result.frames()[0].resolution(), Resolution::new(256, 256));
    assert_eq!(inpainter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stalled_inference_times_out() {
    let coordinator = ArcCoordinator::new(TelemetrySink::default(), InferenceConfig::default());
    let orchestrator = InpaintOrchestrator::new(
        Arc::new(StalledInpainter),
        coordinator,
        ResampleConfig::default(),
        Duration::from_millis(50),
    );
    let plan = plan_chunks(2, 2, 0).expect("plan");
    let (frames, masks) = chunk_inputs(2, Resolution::new(8, 8));

    let err = orchestrator
        .process_chunk(plan[0], &frames, &masks, 960)
        .await
        .expect_err("timeout");
    match err {
        PipelineError::Inference { kind, range, .. } => {
            assert_eq!(kind, InferenceKind::Timeout);
            assert_eq!(range, FrameRange::new(0, 2));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn lazy_service_loads_once_and_reloads_after_shutdown() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let service: InferenceService<dyn Inpainter> = InferenceService::lazy("temporal-fill", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TemporalFillInpainter::default()) as Arc<dyn Inpainter>)
    });

    assert!(!service.is_loaded().await);
    service.get().await.expect("load");
    service.get().await.expect("cached");
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(service.is_loaded().await);

    service.shutdown().await;
    assert!(!service.is_loaded().await);
    service.get().await.expect("reload");
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ready_service_cannot_be_revived_after_shutdown() {
    let backend: Arc<dyn Inpainter> = Arc::new(TemporalFillInpainter::default());
    let service = InferenceService::ready("inpainter", backend);
    assert!(service.get().await.is_ok());
    service.shutdown().await;
    assert!(service.get().await.is_err());
}
