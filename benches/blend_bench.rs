use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use vanish::{
    Frame, Resolution,
    config::BlendConfig,
    pipeline::{ChunkResult, OverlapBlender, plan_chunks},
};

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_chunks");
    for &overlap in &[0usize, 10, 40] {
        group.bench_with_input(BenchmarkId::from_parameter(overlap), &overlap, |b, &overlap| {
            b.iter(|| plan_chunks(100_000, 50, overlap))
        });
    }
    group.finish();
}

fn bench_blend(c: &mut Criterion) {
    let resolution = Resolution::new(320, 180);
    let total = 120;
    let mut group = c.benchmark_group("overlap_blend");
    for &overlap in &[2usize, 10, 20] {
        let plan = plan_chunks(total, 50, overlap).expect("plan");
        let results: Vec<ChunkResult> = plan
            .iter()
            .map(|chunk| {
                let shade = (chunk.index * 60) as u8;
                let frames = chunk
                    .range
                    .indices()
                    .map(|i| Frame::solid(i, resolution, [shade; 3]))
                    .collect();
                ChunkResult::new(*chunk, resolution, frames)
            })
            .collect();
        let blender = OverlapBlender::new(&BlendConfig::default());
        group.bench_with_input(BenchmarkId::from_parameter(overlap), &results, |b, results| {
            b.iter(|| blender.blend(results.clone(), total))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_plan, bench_blend);
criterion_main!(benches);
