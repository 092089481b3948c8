use vanish::{
    FrameRange, PipelineError,
    pipeline::{Chunk, plan_chunks},
};

fn ranges(plan: &[Chunk]) -> Vec<FrameRange> {
    plan.iter().map(|chunk| chunk.range).collect()
}

#[test]
fn ten_frames_in_chunks_of_six_share_two_frames() {
    let plan = plan_chunks(10, 6, 2).expect("plan");
    assert_eq!(
        ranges(&plan),
        vec![FrameRange::new(0, 6), FrameRange::new(4, 10)]
    );
    assert_eq!(plan[0].trailing_overlap(), FrameRange::new(4, 6));
    assert_eq!(plan[1].lead_overlap, 2);
}

#[test]
fn short_video_is_a_single_chunk_without_overlap() {
    let plan = plan_chunks(5, 6, 2).expect("plan");
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].range, FrameRange::new(0, 5));
    assert_eq!(plan[0].lead_overlap, 0);
    assert_eq!(plan[0].trail_overlap, 0);
}

#[test]
fn empty_video_yields_empty_plan() {
    assert!(plan_chunks(0, 6, 2).expect("plan").is_empty());
}

#[test]
fn invalid_geometry_is_a_config_error() {
    assert!(matches!(plan_chunks(10, 0, 0), Err(PipelineError::Config(_))));
    assert!(matches!(plan_chunks(10, 4, 4), Err(PipelineError::Config(_))));
    assert!(matches!(plan_chunks(10, 4, 9), Err(PipelineError::Config(_))));
}

#[test]
fn cores_partition_the_video_for_every_geometry() {
    for total in 1..40 {
        for chunk_len in 1..12 {
            for overlap in 0..chunk_len {
                let plan = plan_chunks(total, chunk_len, overlap).expect("plan");
                let mut next = 0;
                for chunk in &plan {
                    assert!(chunk.len() <= chunk_len);
                    let core = chunk.core();
                    assert_eq!(core.start, next, "N={total} L={chunk_len} O={overlap}");
                    assert!(!core.is_empty());
                    next = core.end;
                }
                assert_eq!(next, total, "N={total} L={chunk_len} O={overlap}");
            }
        }
    }
}

#[test]
fn adjacent_chunks_share_exactly_the_overlap() {
    for total in 1..40 {
        for chunk_len in 2..10 {
            for overlap in 1..chunk_len {
                let plan = plan_chunks(total, chunk_len, overlap).expect("plan");
                for pair in plan.windows(2) {
                    let (earlier, later) = (&pair[0], &pair[1]);
                    assert_eq!(earlier.end() - later.start(), overlap);
                    assert_eq!(earlier.trailing_overlap().len(), overlap);
                    assert_eq!(later.lead_overlap, overlap);
                }
            }
        }
    }
}
