use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use uuid::Uuid;
use weave_core::{Block, BlockKind, CanvasStore, CoreZone, Graph, Rect};

fn note(i: usize) -> Block {
    let x = 800.0 + (i % 50) as f64 * 220.0;
    let y = (i / 50) as f64 * 140.0;
    Block::new(format!("b{i}"), BlockKind::Note, Rect::new(x, y, 200.0, 120.0), Uuid::nil())
}

fn bench_local_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("Canvas store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("move_block_commit", |b| {
        let mut store = CanvasStore::with_client_id(1);
        store.seed_core().unwrap();
        store
            .apply_local_change(|d| {
                for i in 0..200 {
                    d.upsert_block(note(i));
                }
            })
            .unwrap();
        let mut step = 0.0;
        b.iter(|| {
            step += 1.0;
            let update = store
                .apply_local_change(|d| {
                    d.move_block("b7", 800.0 + step, 0.0);
                })
                .unwrap();
            black_box(update);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Canvas store");
    group.throughput(Throughput::Elements(1));

    let mut source = CanvasStore::with_client_id(1);
    source.seed_core().unwrap();
    let update = source
        .apply_local_change(|d| d.upsert_block(note(0)))
        .unwrap()
        .unwrap();

    group.bench_function("apply_remote_update", |b| {
        let mut dest = CanvasStore::with_client_id(2);
        dest.apply_remote_update(&source.encode_state_as_update()).unwrap();
        b.iter(|| {
            dest.apply_remote_update(black_box(&update)).unwrap();
        })
    });

    group.finish();
}

fn bench_layout_guard(c: &mut Criterion) {
    let zone = CoreZone::default();
    let center = zone.rect.center();
    c.bench_function("resolve_overlapping_block", |b| {
        b.iter(|| zone.resolve(black_box(Rect::new(center.x, center.y, 200.0, 120.0))))
    });
}

fn bench_content_hash(c: &mut Criterion) {
    let graph = Graph {
        blocks: (0..500).map(note).collect(),
        ..Graph::default()
    };
    c.bench_function("content_hash_500_blocks", |b| b.iter(|| black_box(&graph).content_hash()));
}

criterion_group!(
    benches,
    bench_local_commit,
    bench_apply_remote,
    bench_layout_guard,
    bench_content_hash
);
criterion_main!(benches);
