use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vanish::{
    Frame, FrameRange, InferenceKind, MaskFrame, PipelineError, Resolution,
    arc::{coordinator::ArcCoordinator, telemetry::TelemetrySink},
    config::{AppConfig, CliArgs},
    inference::{InferenceFault, InferenceServices, Inpainter, RegionGrowSegmenter},
    pipeline,
};

const SIDE: u32 = 16;
const BACKGROUND: [u8; 3] = [120, 120, 120];

fn in_square(x: u32, y: u32) -> bool {
    (4..8).contains(&x) && (4..8).contains(&y)
}

fn write_sequence(dir: &Path, frames: usize, side: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) {
    std::fs::create_dir_all(dir).expect("create fixture dir");
    for index in 0..frames {
        let image = image::RgbImage::from_fn(side, side, |x, y| image::Rgb(pixel(x, y)));
        image
            .save(dir.join(format!("{index:04}.png")))
            .expect("write fixture frame");
    }
}

/// Gray clip with a black square, and a mask video marking the square.
fn fixtures(root: &Path, frames: usize, side: u32) {
    write_sequence(&root.join("color"), frames, side, |x, y| {
        if in_square(x, y) { [0, 0, 0] } else { BACKGROUND }
    });
    write_sequence(&root.join("mask"), frames, side, |x, y| {
        if in_square(x, y) { [255; 3] } else { [0; 3] }
    });
}

fn cli(root: &Path) -> CliArgs {
    CliArgs {
        color_video: root.join("color"),
        mask_video: Some(root.join("mask")),
        output: Some(root.join("out")),
        chunk_len: Some(6),
        overlap: Some(2),
        mask_dilation: Some(0),
        feather: Some(0),
        ..CliArgs::default()
    }
}

fn read_output(dir: &Path) -> Vec<image::RgbImage> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .expect("output dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|path| image::open(path).expect("decode output").to_rgb8())
        .collect()
}

#[tokio::test]
async fn removes_masked_square_from_image_sequence() {
    let root = tempfile::tempdir().expect("tempdir");
    fixtures(root.path(), 10, SIDE);
    let config = AppConfig::load(cli(root.path())).await.expect("config");

    let summary = vanish::run(config, CancellationToken::new())
        .await
        .expect("pipeline run");
    assert_eq!(summary.frames, 10);
    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.retries, 0);
    assert_eq!(summary.telemetry.chunks_succeeded, 2);
    assert_eq!(summary.telemetry.frames_composited, 10);
    assert_eq!(summary.telemetry.stage_count("inpaint"), 2);

    let output = read_output(&root.path().join("out"));
    assert_eq!(output.len(), 10);
    for frame in &output {
        assert_eq!(frame.get_pixel(0, 0).0, BACKGROUND);
        assert_eq!(frame.get_pixel(15, 15).0, BACKGROUND);
        let filled = frame.get_pixel(5, 5).0;
        assert!(
            filled.iter().all(|&c| c.abs_diff(120) <= 2),
            "square not removed: {filled:?}"
        );
    }
}

#[tokio::test]
async fn annotations_drive_mask_generation() {
    let root = tempfile::tempdir().expect("tempdir");
    fixtures(root.path(), 4, SIDE);
    let annotations = root.path().join("prompts.json");
    std::fs::write(
        &annotations,
        r#"{ "keyframes": [ { "frame_idx": 0, "pos_clicks": [[5, 5]] } ] }"#,
    )
    .expect("write annotations");
    let args = CliArgs {
        mask_video: None,
        annotations: Some(annotations),
        ..cli(root.path())
    };
    let config = AppConfig::load(args).await.expect("config");

    let summary = vanish::run(config, CancellationToken::new())
        .await
        .expect("pipeline run");
    assert_eq!(summary.frames, 4);
    let output = read_output(&root.path().join("out"));
    assert!(output.iter().all(|f| f.get_pixel(6, 6).0 != [0, 0, 0]));
}

#[tokio::test]
async fn run_without_mask_source_fails_early() {
    let root = tempfile::tempdir().expect("tempdir");
    let args = CliArgs {
        mask_video: None,
        ..cli(root.path())
    };
    let config = AppConfig::load(args).await.expect("config");
    let err = vanish::run(config, CancellationToken::new())
        .await
        .expect_err("no mask");
    assert!(matches!(err, PipelineError::MissingMask(_)));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn missing_source_is_an_io_error() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = AppConfig::load(cli(root.path())).await.expect("config");
    let err = vanish::run(config, CancellationToken::new())
        .await
        .expect_err("no frames");
    assert!(matches!(err, PipelineError::Io(_)));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn cancelled_run_reports_cancelled() {
    let root = tempfile::tempdir().expect("tempdir");
    fixtures(root.path(), 8, SIDE);
    let config = AppConfig::load(cli(root.path())).await.expect("config");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = vanish::run(config, cancel).await.expect_err("cancelled");
    assert_eq!(err, PipelineError::Cancelled);
    assert!(!root.path().join("out").exists());
}

/// Runs out of memory on the chunk starting at `failing_start` whenever the
/// inference side exceeds `fits_within`.
struct ConstrainedInpainter {
    failing_start: usize,
    fits_within: u32,
    calls: AtomicUsize,
}

#[async_trait]
impl Inpainter for ConstrainedInpainter {
    async fn inpaint(&self, frames: &[Frame], _masks: &[MaskFrame]) -> Result<Vec<Frame>, InferenceFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = &frames[0];
        if first.index() == self.failing_start && first.resolution().longest_side() > self.fits_within {
            return Err(InferenceFault::out_of_memory("allocation failed"));
        }
        Ok(frames.to_vec())
    }
}

struct BrokenInpainter;

#[async_trait]
impl Inpainter for BrokenInpainter {
    async fn inpaint(&self, frames: &[Frame], _masks: &[MaskFrame]) -> Result<Vec<Frame>, InferenceFault> {
        if frames[0].index() == 0 {
            Ok(frames.to_vec())
        } else {
            Err(InferenceFault::model("weights corrupted"))
        }
    }
}

async fn constrained_config(root: &Path) -> AppConfig {
    fixtures(root, 10, 32);
    let mut config = AppConfig::load(cli(root)).await.expect("config");
    config.pipeline.inference.max_resolution = 32;
    config.pipeline.inference.min_resolution = 8;
    config
}

#[tokio::test]
async fn resource_failure_is_retried_at_half_resolution() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = constrained_config(root.path()).await;
    let inpainter = Arc::new(ConstrainedInpainter {
        failing_start: 4,
        fits_within: 16,
        calls: AtomicUsize::new(0),
    });
    let services = InferenceServices::from_backends(
        inpainter.clone(),
        Arc::new(RegionGrowSegmenter::new(24)),
    );
    let telemetry = TelemetrySink::default();
    let coordinator = ArcCoordinator::new(telemetry.clone(), config.pipeline.inference.clone());

    let summary = pipeline::execute_pipeline(&config, &services, coordinator, CancellationToken::new())
        .await
        .expect("recovered run");
    assert_eq!(summary.retries, 1);
    assert_eq!(summary.telemetry.retries, 1);
    // Chunk 0 once, chunk 1 at 32 and again at 16.
    assert_eq!(inpainter.calls.load(Ordering::SeqCst), 3);
    assert_eq!(read_output(&root.path().join("out")).len(), 10);
}

#[tokio::test]
async fn persistent_resource_failure_stops_at_minimum_resolution() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = constrained_config(root.path()).await;
    let inpainter = Arc::new(ConstrainedInpainter {
        failing_start: 4,
        fits_within: 4,
        calls: AtomicUsize::new(0),
    });
    let services = InferenceServices::from_backends(
        inpainter.clone(),
        Arc::new(RegionGrowSegmenter::new(24)),
    );
    let telemetry = TelemetrySink::default();
    let coordinator = ArcCoordinator::new(telemetry.clone(), config.pipeline.inference.clone());

    let err = pipeline::execute_pipeline(&config, &services, coordinator, CancellationToken::new())
        .await
        .expect_err("chunk never fits");
    assert_eq!(err.exit_code(), 4);
    let PipelineError::PartialFailure(report) = &err else {
        panic!("expected a partial failure, got {err:?}");
    };
    assert_eq!(report.succeeded, vec![FrameRange::new(0, 6)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].chunk.range, FrameRange::new(4, 10));
    match &report.failed[0].error {
        PipelineError::Inference {
            kind, resolution, ..
        } => {
            assert_eq!(*kind, InferenceKind::OutOfMemory);
            assert_eq!(*resolution, Some(Resolution::new(8, 8)));
        }
        other => panic!("unexpected chunk error {other:?}"),
    }
    // 32 -> 16 -> 8, then halving would go below the floor.
    assert_eq!(telemetry.snapshot().retries, 2);
    assert!(!root.path().join("out").exists());
}

#[tokio::test]
async fn model_failure_is_not_retried() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = constrained_config(root.path()).await;
    let services = InferenceServices::from_backends(
        Arc::new(BrokenInpainter),
        Arc::new(RegionGrowSegmenter::new(24)),
    );
    let telemetry = TelemetrySink::default();
    let coordinator = ArcCoordinator::new(telemetry.clone(), config.pipeline.inference.clone());

    let err = pipeline::execute_pipeline(&config, &services, coordinator, CancellationToken::new())
        .await
        .expect_err("model failure");
    let PipelineError::PartialFailure(report) = &err else {
        panic!("expected a partial failure, got {err:?}");
    };
    assert_eq!(report.failed[0].chunk.range, FrameRange::new(4, 10));
    assert!(format!("{err}").contains("[4, 10)"));
    assert_eq!(telemetry.snapshot().retries, 0);
}

#[tokio::test]
async fn overlap_wider_than_half_a_chunk_runs_end_to_end() {
    let root = tempfile::tempdir().expect("tempdir");
    fixtures(root.path(), 10, SIDE);
    let args = CliArgs {
        overlap: Some(4),
        ..cli(root.path())
    };
    let config = AppConfig::load(args).await.expect("config");

    let summary = vanish::run(config, CancellationToken::new())
        .await
        .expect("pipeline run");
    assert_eq!(summary.chunks, 3);
    let output = read_output(&root.path().join("out"));
    assert_eq!(output.len(), 10);
    for frame in &output {
        assert_eq!(frame.get_pixel(0, 0).0, BACKGROUND);
        assert!(frame.get_pixel(5, 5).0.iter().all(|&c| c.abs_diff(120) <= 2));
    }
}

#[tokio::test]
async fn generated_masks_are_exported_and_reusable() {
    let root = tempfile::tempdir().expect("tempdir");
    fixtures(root.path(), 4, SIDE);
    let annotations = root.path().join("prompts.json");
    std::fs::write(
        &annotations,
        r#"{ "keyframes": [ { "frame_idx": 0, "pos_clicks": [[5, 5]] } ] }"#,
    )
    .expect("write annotations");
    let exported = root.path().join("authored_mask");
    let args = CliArgs {
        mask_video: None,
        annotations: Some(annotations),
        mask_output: Some(exported.clone()),
        ..cli(root.path())
    };
    let config = AppConfig::load(args).await.expect("config");
    vanish::run(config, CancellationToken::new())
        .await
        .expect("annotated run");

    let masks = read_output(&exported);
    assert_eq!(masks.len(), 4);
    for mask in &masks {
        assert_eq!(mask.get_pixel(5, 5).0, [255; 3]);
        assert_eq!(mask.get_pixel(0, 0).0, [0; 3]);
        assert_eq!(mask.get_pixel(12, 12).0, [0; 3]);
    }

    // The exported sequence feeds a later run as its mask video.
    let args = CliArgs {
        mask_video: Some(exported),
        output: Some(root.path().join("reused")),
        ..cli(root.path())
    };
    let config = AppConfig::load(args).await.expect("config");
    let summary = vanish::run(config, CancellationToken::new())
        .await
        .expect("reused mask run");
    assert_eq!(summary.frames, 4);
    let output = read_output(&root.path().join("reused"));
    assert!(output.iter().all(|f| f.get_pixel(5, 5).0 != [0, 0, 0]));
}
