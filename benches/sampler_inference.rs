/* benches/sampler_inference.rs */
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use criterion::{
    black_box, criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion,
    PlotConfiguration, Throughput,
};
use ndarray::{Array3, Array4};

use kinetra::kinetra_core::{
    ExecContext, FusionEncoderConfig, ObservationBatch, PolicyBundle, PolicyConfig,
    UniformResampler,
};
use kinetra::kinetra_core::CloudResampler;

fn synthetic_observation(points: usize) -> ObservationBatch {
    ObservationBatch {
        point_cloud: Some(Array4::from_shape_fn((1, 2, points, 3), |(_, t, n, c)| {
            ((t * 31 + n * 7 + c) % 13) as f32 * 0.1
        })),
        agent_pos: Some(Array3::from_elem((1, 2, 20), 0.25)),
        ..Default::default()
    }
}

fn seeded_policy(num_inference_steps: usize) -> kinetra::kinetra_core::DiffusionPolicy {
    let config = PolicyConfig {
        num_inference_steps,
        ..Default::default()
    };
    PolicyBundle::seeded(config, FusionEncoderConfig::default(), 256, 64, 42)
        .expect("seeded bundle")
        .into_policy(ExecContext::default())
        .expect("policy")
}

/// Benchmark the full predict pipeline across denoising iteration counts
fn bench_predict_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict_pipeline");
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic));

    let obs = synthetic_observation(1024);
    for &steps in &[2, 5, 10, 25] {
        let policy = seeded_policy(steps);
        group.throughput(Throughput::Elements(steps as u64));
        group.bench_with_input(
            BenchmarkId::new("inference_steps", steps),
            &steps,
            |b, &_steps| {
                b.iter(|| black_box(policy.predict_action(black_box(&obs), None).unwrap()))
            },
        );
    }
    group.finish();
}

/// Benchmark point-cloud resampling across source sizes
fn bench_cloud_resampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("cloud_resampling");

    let resampler = UniformResampler::default();
    for &source in &[1024usize, 4096, 16384] {
        let cloud = Array3::from_shape_fn((2, source, 3), |(t, n, k)| {
            (t * 100_000 + n * 3 + k) as f32
        });
        group.throughput(Throughput::Elements(source as u64));
        group.bench_with_input(
            BenchmarkId::new("resample_to_4096", source),
            &source,
            |b, &_size| b.iter(|| black_box(resampler.resample(black_box(&cloud), 4096).unwrap())),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_predict_pipeline, bench_cloud_resampling);
criterion_main!(benches);
