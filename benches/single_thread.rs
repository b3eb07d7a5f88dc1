use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SIZE: usize = 10_000;

#[derive(Clone, Copy)]
struct RandomKeys {
    state: usize,
}

impl RandomKeys {
    fn new() -> Self {
        RandomKeys { state: 0 }
    }
}

impl Iterator for RandomKeys {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        // Add 1 then multiply by some 32 bit prime.
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state)
    }
}

fn read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    group.bench_function("seqmap", |b| {
        let m = seqmap::HashMap::<usize, usize>::builder()
            .capacity(SIZE / 2)
            .build();

        for i in RandomKeys::new().take(SIZE) {
            m.pin().emplace(i, i);
        }

        b.iter(|| {
            let m = m.pin();
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(m.try_get_value(&i), Some(i)));
            }
        });
    });

    group.bench_function("std", |b| {
        let mut m = HashMap::<usize, usize>::default();
        for i in RandomKeys::new().take(SIZE) {
            m.insert(i, i);
        }

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(m.get(&i), Some(&i)));
            }
        });
    });

    group.bench_function("dashmap", |b| {
        let m = dashmap::DashMap::<usize, usize>::default();
        for i in RandomKeys::new().take(SIZE) {
            m.insert(i, i);
        }

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(*m.get(&i).unwrap(), i));
            }
        });
    });

    group.finish();
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    group.bench_function("seqmap", |b| {
        b.iter(|| {
            let m = seqmap::HashMap::<usize, usize>::new();
            let guard = m.guard();
            for i in RandomKeys::new().take(SIZE) {
                black_box(m.emplace(i, i, &guard));
            }
        });
    });

    group.bench_function("std", |b| {
        b.iter(|| {
            let mut m = HashMap::<usize, usize>::default();
            for i in RandomKeys::new().take(SIZE) {
                black_box(m.insert(i, i));
            }
        });
    });

    group.bench_function("dashmap", |b| {
        b.iter(|| {
            let m = dashmap::DashMap::<usize, usize>::default();
            for i in RandomKeys::new().take(SIZE) {
                black_box(m.insert(i, i));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, read, insert);
criterion_main!(benches);
