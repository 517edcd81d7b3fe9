//! Micro benchmarks for the generation-safe tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use gentree::{
    GenTree, NoopMonitor, Pager, PagerOptions, RecoveryCoordinator, TreeOptions, U64Layout,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

const RANGE_WIDTH: u64 = 512;
const LOOKUP_SAMPLES: usize = 4_096;

/// Reduced sizes when `GENTREE_BENCH_FAST` is set.
struct BenchTuning {
    insert_count: u64,
    sample_size: usize,
}

impl BenchTuning {
    fn from_env() -> Self {
        if std::env::var_os("GENTREE_BENCH_FAST").is_some() {
            Self {
                insert_count: 2_048,
                sample_size: 10,
            }
        } else {
            Self {
                insert_count: 32_768,
                sample_size: 30,
            }
        }
    }
}

fn micro_tree(c: &mut Criterion) {
    let tuning = BenchTuning::from_env();
    let count = tuning.insert_count;
    let mut group = c.benchmark_group("micro/gentree");
    group.sample_size(tuning.sample_size);

    group.throughput(Throughput::Elements(count));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_keys(0..count);
                black_box(tree.tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..count).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(count));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.insert_keys(random_keys.iter().copied());
                black_box(tree.tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(count));
    group.bench_function("remove_random", |b| {
        b.iter_batched(
            || {
                let tree = FreshTree::new();
                tree.insert_keys(0..count);
                tree.tree.checkpoint().expect("checkpoint");
                tree
            },
            |tree| {
                for key in &random_keys {
                    tree.tree.remove(key).expect("remove");
                }
                black_box(tree.tree.root());
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = FreshTree::new();
    loaded.insert_keys(0..count);
    loaded.tree.checkpoint().expect("checkpoint");
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);

    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_get", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(0..count);
                black_box(loaded.tree.get(&key).expect("get"));
            }
        });
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_seek", RANGE_WIDTH), |b| {
        b.iter(|| {
            let start = rng.gen_range(0..count.saturating_sub(RANGE_WIDTH).max(1));
            let mut cursor = loaded
                .tree
                .seek(&start, &(start + RANGE_WIDTH))
                .expect("seek");
            let mut seen = 0u64;
            while let Some(entry) = cursor.next().expect("next") {
                black_box(entry);
                seen += 1;
            }
            black_box(seen);
        });
    });

    group.finish();
}

struct FreshTree {
    _tmpdir: TempDir,
    tree: GenTree<U64Layout>,
}

impl FreshTree {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let path = tmpdir.path().join("bench.gt");
        let pager = Pager::open(&path, PagerOptions::default()).expect("pager");
        let tree = GenTree::open(
            Arc::new(pager),
            U64Layout,
            TreeOptions::default(),
            |_| {},
            &RecoveryCoordinator::immediate(),
            Arc::new(NoopMonitor),
        )
        .expect("tree");
        Self {
            _tmpdir: tmpdir,
            tree,
        }
    }

    fn insert_keys(&self, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            self.tree.insert(key, key).expect("insert");
        }
    }
}

criterion_group!(benches, micro_tree);
criterion_main!(benches);
