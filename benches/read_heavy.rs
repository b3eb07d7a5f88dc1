use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SIZE: usize = 1 << 14;

// Measures lookups from all cores while a single writer churns a disjoint key range.
fn run<M: Sync>(
    iters: u64,
    map: &M,
    read: impl Fn(&M, usize) -> bool + Sync,
    write: impl Fn(&M, usize) + Sync,
) -> Duration {
    let readers = num_cpus::get_physical().max(2) - 1;
    let barrier = Barrier::new(readers + 1);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut i = 0;
            while !done.load(Ordering::Relaxed) {
                write(map, SIZE + (i % SIZE));
                i += 1;
            }
        });

        let handles: Vec<_> = (0..readers)
            .map(|_| {
                let (barrier, read) = (&barrier, &read);
                s.spawn(move || {
                    barrier.wait();
                    let start = Instant::now();
                    for _ in 0..iters {
                        for i in 0..SIZE {
                            assert!(black_box(read(map, i)));
                        }
                    }
                    start.elapsed()
                })
            })
            .collect();

        barrier.wait();
        let elapsed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .max()
            .unwrap_or_default();

        done.store(true, Ordering::Relaxed);
        elapsed
    })
}

fn read_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_heavy");

    group.bench_function("seqmap", |b| {
        let m = seqmap::HashMap::<usize, usize>::builder()
            .capacity(SIZE)
            .build();
        for i in 0..SIZE {
            m.pin().emplace(i, i);
        }

        b.iter_custom(|iters| {
            run(
                iters,
                &m,
                |m, i| m.pin().contains(&i),
                |m, i| {
                    let m = m.pin();
                    if !m.emplace(i, i) {
                        m.erase(&i);
                    }
                },
            )
        });
    });

    group.bench_function("dashmap", |b| {
        let m = dashmap::DashMap::<usize, usize>::with_capacity(SIZE);
        for i in 0..SIZE {
            m.insert(i, i);
        }

        b.iter_custom(|iters| {
            run(
                iters,
                &m,
                |m, i| m.contains_key(&i),
                |m, i| {
                    if m.insert(i, i).is_some() {
                        m.remove(&i);
                    }
                },
            )
        });
    });

    group.bench_function("rwlock", |b| {
        let m = RwLock::new(std::collections::HashMap::<usize, usize>::with_capacity(SIZE));
        for i in 0..SIZE {
            m.write().unwrap().insert(i, i);
        }

        b.iter_custom(|iters| {
            run(
                iters,
                &m,
                |m, i| m.read().unwrap().contains_key(&i),
                |m, i| {
                    let mut m = m.write().unwrap();
                    if m.insert(i, i).is_some() {
                        m.remove(&i);
                    }
                },
            )
        });
    });

    group.finish();
}

criterion_group!(benches, read_heavy);
criterion_main!(benches);
