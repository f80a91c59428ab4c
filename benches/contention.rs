use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use striped_cuckoo_filter::CuckooFilter;

fn splat(i: u64) -> u64 {
    i.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Lookup latency while background threads are also reading. Optimistic
/// stamps keep readers from contending with each other.
fn might_contain_under_read_load(c: &mut Criterion) {
    let filter = Arc::new(CuckooFilter::create(131_072).build().unwrap());
    for i in 0..100_000 {
        assert!(filter.put(splat(i * 2)));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = vec![];
    for _ in 0..4 {
        let filter = Arc::clone(&filter);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                i = (i + 1) % 200_000;
                black_box(filter.might_contain(splat(i)));
            }
        }));
    }

    let mut i = 0u64;
    c.bench_function("contention::might_contain_under_read_load", |b| {
        b.iter(|| {
            i = (i + 1) % 200_000;
            black_box(filter.might_contain(splat(i)));
        })
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Lookup latency while background threads insert and remove through a
/// sliding window, forcing stamp invalidations and shared-lock retries.
fn might_contain_under_write_load(c: &mut Criterion) {
    let filter = Arc::new(CuckooFilter::create(131_072).build().unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = vec![];
    for thread_id in 0..4u64 {
        let filter = Arc::clone(&filter);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            let mut i = thread_id * 1_000_000;
            while !stop.load(Ordering::Relaxed) {
                i += 1;
                let _ = filter.put(splat(i));
                filter.remove(splat(i.wrapping_sub(10_000)));
            }
        }));
    }

    let mut i = 0u64;
    c.bench_function("contention::might_contain_under_write_load", |b| {
        b.iter(|| {
            i += 1;
            black_box(filter.might_contain(splat(i)));
        })
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Insert throughput with every writer hammering the same stripe bank.
fn put_under_write_load(c: &mut Criterion) {
    let filter = Arc::new(CuckooFilter::create(1 << 20).build().unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = vec![];
    for thread_id in 0..4u64 {
        let filter = Arc::clone(&filter);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            let mut i = (thread_id + 1) * 10_000_000;
            while !stop.load(Ordering::Relaxed) {
                i += 1;
                let _ = filter.put(splat(i));
                filter.remove(splat(i.wrapping_sub(10_000)));
            }
        }));
    }

    let mut i = 0u64;
    c.bench_function("contention::put_under_write_load", |b| {
        b.iter(|| {
            i += 1;
            let _ = black_box(filter.put(splat(i)));
            filter.remove(splat(i.wrapping_sub(10_000)));
        })
    });

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
}

criterion_group!(
    benches,
    might_contain_under_read_load,
    might_contain_under_write_load,
    put_under_write_load
);
criterion_main!(benches);
