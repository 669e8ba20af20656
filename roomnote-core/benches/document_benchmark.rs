use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roomnote_core::ReplicatedDocument;

fn bench_local_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append_local_edit", |b| {
        // Appends to an ever-growing document, like a user typing.
        let doc = ReplicatedDocument::new();
        b.iter(|| {
            let end = doc.len();
            let op = doc.apply_local_edit(black_box(end), 0, black_box("x")).unwrap();
            black_box(op);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document Operations");
    group.throughput(Throughput::Elements(1));

    let source = ReplicatedDocument::new();
    let op = source.apply_local_edit(0, 0, "hello room").unwrap().unwrap();

    group.bench_function("apply_remote_operation", |b| {
        // Re-applying the same update exercises the idempotent path.
        let dest = ReplicatedDocument::new();
        b.iter(|| {
            dest.apply_remote_operation(black_box(&op.payload)).unwrap();
        })
    });

    group.bench_function("encode_full_state_4k", |b| {
        let doc = ReplicatedDocument::new();
        doc.apply_local_edit(0, 0, &"lorem ipsum ".repeat(350)).unwrap();
        b.iter(|| black_box(doc.encode_full_state()))
    });

    group.finish();
}

criterion_group!(benches, bench_local_edit, bench_apply_remote);
criterion_main!(benches);
