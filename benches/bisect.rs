//! Benchmark suite for the bisection core
//!
//! Measures pairing, per-unit first-fail scans and batch equivalence
//! metrics at trace sizes typical of a full forward pass.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use bisectar::bisect::{bisect_units, first_fail, StageDigests};
use bisectar::equivalence::compute_metrics;
use bisectar::pairing::{pair_records, KeyProjection};
use bisectar::record::{ObservedValues, RecordIdentity, TraceRecord};
use bisectar::Stage;

// ===========================================================================
// Fixtures
// ===========================================================================

fn create_trace(prompts: usize, layers: i64, diverge: bool) -> Vec<TraceRecord> {
    let mut records = Vec::with_capacity(prompts * layers as usize * Stage::ORDER.len());
    for p in 0..prompts {
        for layer in 0..layers {
            for stage in Stage::ORDER {
                let hash = if diverge && stage == Stage::MlpOut {
                    format!("{p}-{layer}-drift")
                } else {
                    format!("{p}-{layer}-{}", stage.name())
                };
                records.push(TraceRecord::new(
                    RecordIdentity {
                        prompt_id: Some(format!("p{p}")),
                        pos_id: Some(0),
                        layer: Some(layer),
                        tensor: Some(stage.name().to_string()),
                        phase: Some("decode0".to_string()),
                        ..Default::default()
                    },
                    ObservedValues {
                        hash: Some(hash),
                        ..Default::default()
                    },
                ));
            }
        }
    }
    records
}

fn digests(mismatch_at: Option<Stage>) -> StageDigests {
    Stage::ORDER
        .iter()
        .map(|s| {
            let d = if Some(*s) == mismatch_at { "x" } else { s.name() };
            (*s, d.to_string())
        })
        .collect()
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn benchmark_first_fail(c: &mut Criterion) {
    let base = digests(None);
    let mut group = c.benchmark_group("first_fail");
    for stage in [Stage::EmbedOut, Stage::AttnOut, Stage::Logits] {
        let other = digests(Some(stage));
        group.bench_with_input(BenchmarkId::from_parameter(stage.name()), &other, |b, other| {
            b.iter(|| black_box(first_fail(black_box(&base), black_box(other))));
        });
    }
    group.bench_function("pass", |b| {
        b.iter(|| black_box(first_fail(black_box(&base), black_box(&base))));
    });
    group.finish();
}

fn benchmark_pairing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pair_records");
    for prompts in [1, 8, 32] {
        let a = create_trace(prompts, 24, false);
        let b = create_trace(prompts, 24, true);
        let projection = KeyProjection::strict();
        group.bench_with_input(BenchmarkId::from_parameter(prompts), &prompts, |bench, _| {
            bench.iter(|| black_box(pair_records(&a, &b, &projection).matched.len()));
        });
    }
    group.finish();
}

fn benchmark_bisect_units(c: &mut Criterion) {
    let a = create_trace(16, 24, false);
    let b = create_trace(16, 24, true);
    let pairing = pair_records(&a, &b, &KeyProjection::strict());
    c.bench_function("bisect_units_16x24", |bench| {
        bench.iter(|| black_box(bisect_units(black_box(&pairing))));
    });
}

fn benchmark_compute_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_metrics");
    for len in [256usize, 4096, 32_000] {
        let a: Vec<f64> = (0..len).map(|i| (i as f64 * 0.01).sin()).collect();
        let b: Vec<f64> = a.iter().map(|v| v + 1e-4).collect();
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |bench, _| {
            bench.iter(|| black_box(compute_metrics([(&a[..], &b[..])])));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_first_fail,
    benchmark_pairing,
    benchmark_bisect_units,
    benchmark_compute_metrics
);
criterion_main!(benches);
