//! Component benchmarks: row codec and diff throughput.
//!
//! Run with: `cargo bench --bench codec`

#[path = "../../common/mod.rs"]
mod common;

use common::criterion_config::default_criterion;

use crosscat::schema::{FeatureFamily, FeatureValue, ProductSchema, SchemaIndex};
use crosscat::value::{DiffEngine, FeatureValues, SparseCodec};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const N_FEATURES: usize = 256;

fn schema() -> SchemaIndex {
    SchemaIndex::new(
        ProductSchema::new()
            .with(FeatureFamily::BetaBernoulli, N_FEATURES / 2)
            .with(FeatureFamily::GammaPoisson, N_FEATURES / 4)
            .with(FeatureFamily::NormalInverseChiSq, N_FEATURES / 4),
    )
}

/// Every `stride`-th feature observed.
fn row(index: &SchemaIndex, stride: usize, salt: u32) -> FeatureValues {
    index
        .feature_ids()
        .filter(|id| (*id as usize) % stride == 0)
        .map(|id| {
            let value = match index.family_of(id) {
                Ok(FeatureFamily::BetaBernoulli) => FeatureValue::Boolean((id + salt) % 2 == 0),
                Ok(FeatureFamily::NormalInverseChiSq) => FeatureValue::Real((id + salt) as f32 * 0.5),
                _ => FeatureValue::Count(id + salt),
            };
            (id, value)
        })
        .collect()
}

fn bench_encode_decode(c: &mut Criterion) {
    let index = schema();
    let codec = SparseCodec::new(&index);
    let mut group = c.benchmark_group("component/codec");

    // Stride 1 encodes dense, larger strides sparse.
    for stride in [1usize, 4, 32] {
        let values = row(&index, stride, 0);
        let encoded = codec.encode(&values).unwrap();
        group.throughput(Throughput::Elements(values.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", stride), &values, |b, values| {
            b.iter(|| black_box(codec.encode(black_box(values)).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", stride), &encoded, |b, encoded| {
            b.iter(|| black_box(codec.decode(black_box(encoded)).unwrap()))
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let index = schema();
    let engine = DiffEngine::new(&index);
    let mut group = c.benchmark_group("component/diff");

    for stride in [1usize, 8] {
        let baseline = row(&index, stride, 0);
        let updated = row(&index, stride, 1);
        let diff = engine.compute_values(&baseline, &updated).unwrap();

        group.bench_function(BenchmarkId::new("compute", stride), |b| {
            b.iter(|| black_box(engine.compute_values(black_box(&baseline), black_box(&updated)).unwrap()))
        });
        group.bench_function(BenchmarkId::new("apply", stride), |b| {
            b.iter(|| black_box(engine.apply_values(black_box(&baseline), black_box(&diff)).unwrap()))
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = default_criterion();
    targets = bench_encode_decode, bench_diff
}
criterion_main!(benches);
