use std::path::PathBuf;

use vanish::{
    PipelineError,
    config::{AppConfig, BlendCurve, CliArgs, PipelineConfig, ResampleFilter, default_output_path},
};

fn base_cli() -> CliArgs {
    CliArgs {
        color_video: PathBuf::from("clip.mp4"),
        mask_video: Some(PathBuf::from("clip_mask.mp4")),
        ..CliArgs::default()
    }
}

#[tokio::test]
async fn config_loads_defaults_successfully() {
    let config = AppConfig::load(base_cli()).await.expect("load defaults");
    assert_eq!(config.pipeline.chunking.chunk_len, 50);
    assert_eq!(config.pipeline.chunking.overlap, 10);
    assert_eq!(config.pipeline.inference.max_resolution, 960);
    assert_eq!(config.pipeline.io.mask_dilation, 8);
    assert_eq!(config.pipeline.resample.color, ResampleFilter::Area);
    assert_eq!(config.pipeline.resample.mask, ResampleFilter::Nearest);
    assert_eq!(config.pipeline.blend.curve, BlendCurve::Linear);
    assert_eq!(config.output_path, PathBuf::from("clip.mp4_vanished.mkv"));
}

#[tokio::test]
async fn cli_flags_override_document_values() {
    let cli = CliArgs {
        resolution: Some(480),
        chunk_len: Some(12),
        overlap: Some(3),
        start_frame: Some(5),
        max_frames: Some(20),
        soft_mask: true,
        ..base_cli()
    };
    let config = AppConfig::load(cli).await.expect("load with overrides");
    assert_eq!(config.pipeline.inference.max_resolution, 480);
    assert_eq!(config.pipeline.chunking.chunk_len, 12);
    assert_eq!(config.pipeline.chunking.overlap, 3);
    assert_eq!(config.window.start, 5);
    assert_eq!(config.window.max_frames, Some(20));
    assert!(config.pipeline.io.soft_mask);
    assert_eq!(config.pipeline.resample.mask, ResampleFilter::Area);
}

#[tokio::test]
async fn config_rejects_overlap_not_smaller_than_chunk() {
    let cli = CliArgs {
        chunk_len: Some(8),
        overlap: Some(8),
        ..base_cli()
    };
    let err = AppConfig::load(cli).await.expect_err("overlap == chunk_len");
    assert!(matches!(err, PipelineError::Config(_)));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn config_rejects_zero_chunk_length() {
    let cli = CliArgs {
        chunk_len: Some(0),
        overlap: Some(0),
        ..base_cli()
    };
    let err = AppConfig::load(cli).await.expect_err("zero chunk length");
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn explicitly_named_missing_document_fails() {
    let cli = CliArgs {
        config: Some(PathBuf::from("does/not/exist.toml")),
        ..base_cli()
    };
    let err = AppConfig::load(cli).await.expect_err("missing document");
    assert!(format!("{err}").contains("does/not/exist.toml"));
}

#[tokio::test]
async fn document_tables_are_read_from_named_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        "[chunking]\nchunk_len = 20\noverlap = 4\n\n[blend]\ncurve = \"smoothstep\"\n",
    )
    .expect("write config");
    let cli = CliArgs {
        config: Some(path),
        ..base_cli()
    };
    let config = AppConfig::load(cli).await.expect("load custom");
    assert_eq!(config.pipeline.chunking.chunk_len, 20);
    assert_eq!(config.pipeline.chunking.overlap, 4);
    assert_eq!(config.pipeline.blend.curve, BlendCurve::Smoothstep);
    // Untouched tables keep their defaults.
    assert_eq!(config.pipeline.inference.max_resolution, 960);
}

#[test]
fn validation_rejects_out_of_range_values() {
    let mut config = PipelineConfig::default();
    config.inference.min_resolution = 2000;
    assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

    let mut config = PipelineConfig::default();
    config.io.mask_threshold = 1.5;
    assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

    let mut config = PipelineConfig::default();
    config.inference.workers = 0;
    assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

    assert!(PipelineConfig::default().validate().is_ok());
}

#[test]
fn malformed_document_is_a_config_error() {
    let err = PipelineConfig::from_toml("[chunking]\nchunk_len = \"many\"").expect_err("bad type");
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn directory_inputs_get_a_sibling_output_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let frames = dir.path().join("shots");
    std::fs::create_dir(&frames).expect("mkdir");
    let output = default_output_path(&frames);
    assert_eq!(output, dir.path().join("shots_vanished"));
}
