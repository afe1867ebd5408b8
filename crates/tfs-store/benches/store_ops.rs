#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tfs_store::BlockStore;
use tfs_types::Inode;

fn make_store(capacity: u64) -> BlockStore {
    BlockStore::new(capacity).expect("store")
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_read_hit(c: &mut Criterion) {
    let store = make_store(1 << 20);
    let payload = vec![0x5A_u8; 4096];
    assert_eq!(store.insert_read(Inode(1), 0, &payload), 4096);

    let mut buf = vec![0_u8; 4096];
    c.bench_function("store_read_hit_4k", |b| {
        b.iter(|| {
            let n = store.read_range(black_box(Inode(1)), black_box(0), &mut buf);
            assert_eq!(n, 4096);
        });
    });
}

fn bench_read_miss(c: &mut Criterion) {
    let store = make_store(1 << 20);
    let mut buf = vec![0_u8; 4096];
    c.bench_function("store_read_miss_4k", |b| {
        b.iter(|| {
            let n = store.read_range(black_box(Inode(99)), black_box(0), &mut buf);
            assert_eq!(n, 0);
        });
    });
}

fn bench_insert_with_eviction(c: &mut Criterion) {
    // Capacity for 8 entries over a 64-entry working set: every insert
    // past warm-up evicts.
    let store = make_store(8 * 4096);
    let payload = vec![0x17_u8; 4096];

    let mut slot = 0_u64;
    c.bench_function("store_insert_evict_4k", |b| {
        b.iter(|| {
            let offset = (slot % 64) * 4096;
            let admitted = store.insert_read(black_box(Inode(1)), black_box(offset), &payload);
            assert_eq!(admitted, 4096);
            slot += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_read_hit,
    bench_read_miss,
    bench_insert_with_eviction
);
criterion_main!(benches);
