use std::hint::black_box;
use std::path::PathBuf;

use clipsearch::index::VectorIndex;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;

const DIM: usize = 512;

fn random_vector(rng: &mut impl Rng) -> Vec<f32> {
    (0..DIM).map(|_| rng.random_range(-1.0..1.0)).collect()
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("VectorIndex");
    let mut rng = rand::rng();

    for n in [10_000, 100_000] {
        let index = VectorIndex::new("bench");
        for i in 0..n {
            let path = PathBuf::from(format!("/images/{:06}.jpg", i));
            index.upsert(&path, random_vector(&mut rng)).unwrap();
        }
        let probe = random_vector(&mut rng);

        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(format!("query_top24_{}", n), |b| {
            b.iter(|| index.query(black_box(&probe), 24).unwrap());
        });
        group.bench_function(format!("query_top200_{}", n), |b| {
            b.iter(|| index.query(black_box(&probe), 200).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_query);
criterion_main!(benches);
