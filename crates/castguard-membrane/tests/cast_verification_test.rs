//! End-to-end checks: manifest -> descriptors and registration -> shadow
//! records -> verdicts.

use std::sync::Arc;

use castguard_core::{DescriptorBuilder, Hierarchy, LoadedManifest, RegistrationEntry, RegistrationTable, TypeHash, manifest};
use castguard_membrane::{
    AcceptReason, AllocationKind, AllocationRecord, CastVerdict, CheckMode, DescriptorRef,
    MemorySink, RejectReason, Runtime, RuntimeConfig, ShadowGeometry, ShadowTable,
};

const MANIFEST: &str = r#"{
  "types": [
    { "name": "class.Shape", "size": 16,
      "fields": [ { "offset": 0, "type": "ptr" }, { "offset": 8, "type": "i64" } ] },
    { "name": "class.Circle", "size": 24,
      "fields": [ { "offset": 0, "type": "class.Shape" }, { "offset": 16, "type": "double" } ] },
    { "name": "class.Tagged", "size": 16,
      "fields": [ { "offset": 0, "type": "class.Shape" } ] },
    { "name": "class.Cell", "size": 16,
      "fields": [ { "offset": 0, "type": "i64" }, { "offset": 8, "type": "i64" } ] },
    { "name": "class.Grid", "size": 80,
      "fields": [ { "offset": 0, "type": "i64" },
                  { "offset": 8, "type": "class.Circle" },
                  { "offset": 32, "type": { "array": "class.Cell", "count": 3 } } ] }
  ]
}"#;

const ARENA: usize = 0x100_0000;
const ARENA_SIZE: usize = 0x10_0000;

fn h(name: &str) -> TypeHash {
    TypeHash::of_name(name)
}

struct World {
    loaded: LoadedManifest,
    runtime: Runtime,
    sink: Arc<MemorySink>,
}

impl World {
    fn new() -> Self {
        let loaded = manifest::load_str(MANIFEST).unwrap();
        let shadow = ShadowTable::reserve(ShadowGeometry::new(32, 12)).unwrap();
        let sink = Arc::new(MemorySink::new());
        let config = RuntimeConfig::default().with_mode(CheckMode::Report);
        let runtime = Runtime::new(shadow, config, Box::new(sink.clone()));
        runtime.track_range(ARENA, ARENA_SIZE, 3).unwrap();
        runtime.register_hierarchy(&Hierarchy::analyze(&loaded.table));
        Self {
            loaded,
            runtime,
            sink,
        }
    }

    /// Record `count` objects of `name` at `ptr` (None = dynamic array).
    fn record(&self, ptr: usize, name: &str, count: Option<u64>) {
        let ty = self.loaded.type_id(name).unwrap();
        let mut builder = DescriptorBuilder::new(&self.loaded.table);
        let alloc = builder.allocation(ty, count).unwrap();
        let objects = count.unwrap_or(4);
        let mut record = AllocationRecord::new(
            ptr,
            DescriptorRef::from_allocation(&alloc),
            (alloc.element_size * objects) as usize,
        )
        .with_alignment(3)
        .with_kind(AllocationKind::Heap);
        if let Some(n) = count {
            record = record.with_element_count(n);
        }
        self.runtime.record_allocation(&record).unwrap();
    }

    fn cast(&self, src: usize, dst: usize, target: &str) -> CastVerdict {
        self.runtime.check_and_report(src, dst, h(target))
    }
}

fn reason(verdict: CastVerdict) -> Option<RejectReason> {
    match verdict {
        CastVerdict::Reject(v) => Some(v.reason),
        CastVerdict::Accept(_) => None,
    }
}

#[test]
fn every_registered_type_accepts_its_own_hash() {
    let world = World::new();
    let names: Vec<String> = world.loaded.structs().map(|(n, _)| n.to_string()).collect();
    for (i, name) in names.iter().enumerate() {
        let ptr = ARENA + i * 0x200;
        world.record(ptr, name, Some(1));
        assert_eq!(
            world.cast(ptr, ptr, name),
            CastVerdict::Accept(AcceptReason::Exact),
            "{name}"
        );
    }
}

#[test]
fn phantom_pairs_accept_in_both_directions() {
    let world = World::new();
    world.record(ARENA, "class.Shape", Some(1));
    world.record(ARENA + 0x100, "class.Tagged", Some(1));
    assert_eq!(
        world.cast(ARENA, ARENA, "class.Tagged"),
        CastVerdict::Accept(AcceptReason::Ancestor)
    );
    assert_eq!(
        world.cast(ARENA + 0x100, ARENA + 0x100, "class.Shape"),
        CastVerdict::Accept(AcceptReason::Ancestor)
    );
    // Circle is a real subclass with its own storage: no aliasing.
    assert_eq!(
        reason(world.cast(ARENA, ARENA, "class.Circle")),
        Some(RejectReason::TypeMismatch)
    );
}

#[test]
fn ancestor_merge_is_idempotent() {
    let world = World::new();
    let hierarchy = Hierarchy::analyze(&world.loaded.table);
    let table = RegistrationTable::new(hierarchy.registration_entries());
    let before = world.runtime.registry().ancestors(h("class.Shape"));
    let summary = world.runtime.register_types(&table);
    assert_eq!(summary.added, 0);
    assert_eq!(world.runtime.registry().ancestors(h("class.Shape")), before);
    let again = world.runtime.register_types(&table);
    assert_eq!(again, summary);
    assert_eq!(world.runtime.registry().ancestors(h("class.Shape")), before);
}

#[test]
fn bounded_array_resolves_whole_elements_only() {
    let world = World::new();
    world.record(ARENA, "class.Circle", Some(3));
    for i in 0..3 {
        let dst = ARENA + i * 24;
        assert!(world.cast(ARENA, dst, "class.Circle").is_accept(), "element {i}");
        assert!(world.cast(ARENA, dst, "class.Shape").is_accept(), "base of element {i}");
    }
    assert_eq!(
        reason(world.cast(ARENA, ARENA + 72, "class.Circle")),
        Some(RejectReason::UnknownOffset)
    );
    assert_eq!(
        reason(world.cast(ARENA, ARENA + 28, "class.Circle")),
        Some(RejectReason::UnknownOffset)
    );
}

#[test]
fn dynamic_array_wraps_by_element_size() {
    let world = World::new();
    world.record(ARENA, "class.Circle", None);
    assert!(world.cast(ARENA, ARENA + 24 * 3, "class.Circle").is_accept());
    assert_eq!(
        reason(world.cast(ARENA, ARENA + 24 * 3 + 16, "class.Circle")),
        Some(RejectReason::UnknownOffset)
    );
}

#[test]
fn nested_members_and_member_arrays_resolve() {
    let world = World::new();
    world.record(ARENA, "class.Grid", Some(1));
    assert!(world.cast(ARENA, ARENA + 8, "class.Circle").is_accept());
    assert!(world.cast(ARENA, ARENA + 8, "class.Shape").is_accept());
    for cell in [32, 48, 64] {
        assert!(world.cast(ARENA, ARENA + cell, "class.Cell").is_accept(), "cell {cell}");
    }
    assert_eq!(
        reason(world.cast(ARENA, ARENA + 40, "class.Cell")),
        Some(RejectReason::UnknownOffset)
    );
    assert_eq!(
        reason(world.cast(ARENA, ARENA + 32, "class.Circle")),
        Some(RejectReason::TypeMismatch)
    );
}

#[test]
fn interior_source_pointers_use_the_allocation_base() {
    let world = World::new();
    world.record(ARENA, "class.Grid", Some(1));
    // Source points into the middle of the object; offset is still from base.
    assert!(world.cast(ARENA + 48, ARENA + 48, "class.Cell").is_accept());
}

#[test]
fn negative_offsets_always_reject() {
    let world = World::new();
    world.record(ARENA + 0x400, "class.Circle", Some(2));
    for back in [1, 8, 24, 0x400] {
        let verdict = world.cast(ARENA + 0x400, ARENA + 0x400 - back, "class.Circle");
        assert_eq!(reason(verdict), Some(RejectReason::NegativeOffset), "-{back}");
    }
    assert_eq!(world.runtime.metrics().snapshot().rejects_negative_offset, 4);
}

#[test]
fn scenario_unknown_hash_versus_mismatch() {
    // A = 0x1, B = 0x2 with ancestors {0x1}; an object of B lives at X.
    let world = World::new();
    world.runtime.register_types(&RegistrationTable::new(vec![
        RegistrationEntry::new(TypeHash(0x1), vec![]),
        RegistrationEntry::new(TypeHash(0x2), vec![TypeHash(0x1)]),
    ]));
    let b_words: &'static [u64] = Box::leak(vec![16, 0, 0x2, u64::MAX].into_boxed_slice());
    let c_words: &'static [u64] = Box::leak(vec![16, 0, 0x7, u64::MAX].into_boxed_slice());
    // SAFETY: both are terminated single-form descriptors that are never freed.
    let (b, c) = unsafe {
        (
            DescriptorRef::from_raw(b_words.as_ptr().add(1) as usize),
            DescriptorRef::from_raw(c_words.as_ptr().add(1) as usize),
        )
    };
    let x = ARENA + 0x800;
    let y = ARENA + 0x900;
    world.runtime.record_allocation(&AllocationRecord::new(x, b, 16)).unwrap();
    world.runtime.record_allocation(&AllocationRecord::new(y, c, 16)).unwrap();

    let guard = world.runtime.guard();
    assert_eq!(
        guard.resolve_cast(x, x, TypeHash(0x1)),
        CastVerdict::Accept(AcceptReason::Ancestor)
    );
    assert_eq!(
        reason(guard.resolve_cast(x, x, TypeHash(0x3))),
        Some(RejectReason::TypeMismatch)
    );
    // The resolved type 0x7 was never registered.
    assert_eq!(
        reason(guard.resolve_cast(y, y, TypeHash(0x3))),
        Some(RejectReason::UnknownHash)
    );
}

#[test]
fn scenario_four_element_array_stride_sixteen() {
    let world = World::new();
    let y = ARENA + 0x1000;
    world.record(y, "class.Cell", Some(4));
    assert!(world.cast(y, y + 32, "class.Cell").is_accept());
    assert_eq!(
        reason(world.cast(y, y + 64, "class.Cell")),
        Some(RejectReason::UnknownOffset)
    );
}

#[test]
fn rejects_are_reported_with_type_names() {
    let world = World::new();
    world.record(ARENA, "class.Shape", Some(1));
    let verdict = world.cast(ARENA, ARENA, "class.Circle");
    assert!(!verdict.is_accept());
    let records = world.sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.event, "bad_cast");
    assert_eq!(record.reason.as_deref(), Some("type_mismatch"));
    assert_eq!(record.resolved_type.as_deref(), Some("class.Shape"));
    assert_eq!(record.dst_type.as_deref(), Some("class.Circle"));
    assert_eq!(record.mode.as_deref(), Some("report"));
    assert_eq!(world.runtime.metrics().snapshot().reports_emitted, 1);
}

#[test]
fn anonymous_records_are_invisible_to_checks() {
    let world = World::new();
    let ty = world.loaded.type_id("class.Shape").unwrap();
    let mut builder = DescriptorBuilder::new(&world.loaded.table);
    let alloc = builder.allocation(ty, Some(1)).unwrap();
    let record = AllocationRecord::new(ARENA, DescriptorRef::from_allocation(&alloc), 16).anonymous();
    world.runtime.record_allocation(&record).unwrap();
    assert_eq!(
        world.cast(ARENA, ARENA, "class.Circle"),
        CastVerdict::Accept(AcceptReason::UntrackedSource)
    );
}

#[test]
fn concurrent_checks_share_the_runtime() {
    let world = World::new();
    world.record(ARENA, "class.Circle", Some(3));
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for i in 0..100usize {
                    let dst = ARENA + (i % 3) * 24;
                    assert!(world.runtime.resolve_cast(ARENA, dst, h("class.Shape")).is_accept());
                }
            });
        }
    });
    assert_eq!(world.runtime.metrics().snapshot().ancestor_accepts, 400);
}
