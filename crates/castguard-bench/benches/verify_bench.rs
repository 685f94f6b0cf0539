//! Cast verification hot path.

mod common;

use common::{ARENA, Fixture};
use castguard_core::TypeHash;
use criterion::{Criterion, criterion_group, criterion_main};

fn bench_verdicts(c: &mut Criterion) {
    let fx = Fixture::new();
    fx.place(ARENA, "class.Derived", Some(1));
    fx.place(ARENA + 0x1000, "class.Holder", Some(1));
    fx.place(ARENA + 0x2000, "class.Derived", None);

    let derived = TypeHash::of_name("class.Derived");
    let base = TypeHash::of_name("class.Base");
    let other = TypeHash::of_name("class.Other");
    let guard = fx.runtime.guard();
    let mut group = c.benchmark_group("resolve_cast");

    group.bench_function("untracked_source", |b| {
        b.iter(|| guard.resolve_cast(criterion::black_box(0x10), 0x10, derived));
    });
    group.bench_function("exact", |b| {
        b.iter(|| guard.resolve_cast(criterion::black_box(ARENA), ARENA, derived));
    });
    group.bench_function("ancestor", |b| {
        b.iter(|| guard.resolve_cast(criterion::black_box(ARENA), ARENA, base));
    });
    group.bench_function("mismatch", |b| {
        b.iter(|| guard.resolve_cast(criterion::black_box(ARENA), ARENA, other));
    });
    group.bench_function("member_array_element", |b| {
        let holder = ARENA + 0x1000;
        b.iter(|| guard.resolve_cast(criterion::black_box(holder), holder + 16 + 7 * 32, derived));
    });
    group.bench_function("modulo_wrap", |b| {
        let array = ARENA + 0x2000;
        b.iter(|| guard.resolve_cast(criterion::black_box(array), array + 15 * 32, base));
    });
    group.finish();
}

fn bench_policy(c: &mut Criterion) {
    let fx = Fixture::new();
    fx.place(ARENA, "class.Derived", Some(1));
    let base = TypeHash::of_name("class.Base");

    c.bench_function("check_and_report/accept", |b| {
        b.iter(|| fx.runtime.check_and_report(criterion::black_box(ARENA), ARENA, base));
    });
}

criterion_group!(benches, bench_verdicts, bench_policy);
criterion_main!(benches);
