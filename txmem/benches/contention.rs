// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use stronghold_txmem::{Context, FastRwMutex};

/// Uncontended increments of an inline word
pub fn bnc_inline_increment(c: &mut Criterion) {
    let ctx = Context::new();
    let mut handle = ctx.register();
    let var = ctx.create(0usize);

    c.bench_function("bench_inline_increment", |b| {
        b.iter(|| {
            handle
                .read_write(|tx| {
                    let value = tx.load(&var)?;
                    tx.store(&var, value.wrapping_add(1))
                })
                .expect("transaction failed")
        })
    });
}

/// Boxed writes, each one waiting for a grace period
pub fn bnc_boxed_write(c: &mut Criterion) {
    let ctx = Context::new();
    let mut handle = ctx.register();
    let var = ctx.create(vec![0u8; 64]);

    c.bench_function("bench_boxed_write", |b| {
        b.iter(|| {
            handle
                .read_write(|tx| tx.store(&var, vec![1u8; 64]))
                .expect("transaction failed")
        })
    });
}

/// Snapshot reads while other threads keep committing
pub fn bnc_read_only_contended(c: &mut Criterion) {
    let ctx = Arc::new(Context::new());
    let pair = Arc::new((ctx.create(0usize), ctx.create(0usize)));
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let (ctx, pair, stop) = (ctx.clone(), pair.clone(), stop.clone());
            std::thread::spawn(move || {
                let mut handle = ctx.register();
                while !stop.load(Ordering::Relaxed) {
                    handle
                        .read_write(|tx| {
                            let value = tx.load(&pair.0)?;
                            tx.store(&pair.0, value + 1)?;
                            tx.store(&pair.1, value + 1)
                        })
                        .expect("transaction failed");
                }
            })
        })
        .collect();

    let mut handle = ctx.register();
    c.bench_function("bench_read_only_contended", |b| {
        b.iter(|| {
            handle
                .read_only(|tx| Ok(tx.load(&pair.0)? == tx.load(&pair.1)?))
                .expect("read failed")
        })
    });
    drop(handle);

    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.join().expect("writer panicked");
    }
}

pub fn bnc_rw_mutex_shared(c: &mut Criterion) {
    let mutex = FastRwMutex::new();

    c.bench_function("bench_rw_mutex_shared", |b| {
        b.iter(|| {
            let _guard = mutex.read();
        })
    });
}

criterion_group!(
    benches,
    bnc_inline_increment,
    bnc_boxed_write,
    bnc_read_only_contended,
    bnc_rw_mutex_shared
);
criterion_main!(benches);
