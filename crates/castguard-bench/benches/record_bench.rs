//! Metadata write path.

mod common;

use common::{ARENA, Fixture};
use castguard_membrane::AllocationKind;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn bench_inline_vs_bulk(c: &mut Criterion) {
    let fx = Fixture::new();
    let mut group = c.benchmark_group("record_allocation");

    let single = fx.record(ARENA, "class.Derived", Some(1)).with_kind(AllocationKind::Stack);
    group.bench_function("inline_single", |b| {
        b.iter(|| fx.runtime.record_allocation(criterion::black_box(&single)));
    });

    for count in [4u64, 64, 512] {
        let record = fx.record(ARENA, "class.Base", Some(count)).with_kind(AllocationKind::Heap);
        group.bench_with_input(BenchmarkId::new("bounded_array", count), &record, |b, r| {
            b.iter(|| fx.runtime.record_allocation(criterion::black_box(r)));
        });
    }

    let dynamic = fx.record(ARENA, "class.Derived", None).with_kind(AllocationKind::Heap);
    group.bench_function("dynamic_array", |b| {
        b.iter(|| fx.runtime.record_allocation(criterion::black_box(&dynamic)));
    });
    group.finish();
}

fn bench_descriptor_build(c: &mut Criterion) {
    let fx = Fixture::new();
    c.bench_function("descriptor/cold_build", |b| {
        b.iter(|| fx.record(ARENA, "class.Holder", Some(1)));
    });
}

criterion_group!(benches, bench_inline_vs_bulk, bench_descriptor_build);
criterion_main!(benches);
