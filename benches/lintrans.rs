use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use fhe_lintrans::lintrans::{apply_diagonals, BsgsPlan};
use fhe_lintrans::{BlockDiagonals, BlockIndex, EmbeddingMethod, LayerDescriptor, TransformCache};

fn random_diagonals(rng: &mut ChaCha20Rng, count: usize, slots: usize) -> Vec<(i64, Vec<f64>)> {
    (0..count as i64)
        .map(|d| (d, (0..slots).map(|_| rng.gen_range(-1.0..1.0)).collect()))
        .collect()
}

fn bsgs_benchmark(c: &mut Criterion) {
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let slots = 1024;
    let input: Vec<f64> = (0..slots).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut group = c.benchmark_group("block_eval");

    for num_diags in [16, 64, 256] {
        let diags = random_diagonals(&mut rng, num_diags, slots);
        let idxs: Vec<i64> = diags.iter().map(|(i, _)| *i).collect();
        let pairs = || diags.iter().map(|(i, d)| (*i, d.as_slice()));

        let plan = BsgsPlan::new(&idxs, slots, 2.0).unwrap();
        let encoded = plan.encode(pairs()).unwrap();

        group.bench_with_input(
            BenchmarkId::new("bsgs", format!("{}_diags", num_diags)),
            &num_diags,
            |b, _| {
                b.iter(|| encoded.apply(&input));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("naive", format!("{}_diags", num_diags)),
            &num_diags,
            |b, _| {
                b.iter(|| apply_diagonals(pairs(), &input));
            },
        );
    }

    group.finish();
}

fn cache_benchmark(c: &mut Criterion) {
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let slots = 4096;
    let dir = tempfile::tempdir().unwrap();
    let cache = TransformCache::new(dir.path());

    let mut diags = BlockDiagonals::new();
    for col in 0..4 {
        diags.insert(
            BlockIndex::new(0, col),
            random_diagonals(&mut rng, 32, slots).into_iter().collect(),
        );
    }
    let layer = LayerDescriptor::new("bench", diags, 3, 2.0);

    let mut group = c.benchmark_group("cache");
    group.sample_size(10);

    group.bench_function("save", |b| {
        b.iter(|| {
            let mut l = layer.clone();
            cache.save_transforms(&mut l, EmbeddingMethod::Hybrid).unwrap();
        });
    });

    group.bench_function("load", |b| {
        b.iter(|| cache.load_transforms(&layer, EmbeddingMethod::Hybrid).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bsgs_benchmark, cache_benchmark);
criterion_main!(benches);
