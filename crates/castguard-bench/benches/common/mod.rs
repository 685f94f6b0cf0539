//! Shared fixtures for the castguard benchmarks.

#![allow(dead_code)]

use castguard_core::{DescriptorBuilder, Hierarchy, LoadedManifest, manifest};
use castguard_membrane::{
    AllocationRecord, CheckMode, DescriptorRef, MemorySink, Runtime, RuntimeConfig,
    ShadowGeometry, ShadowTable,
};

/// Base of the tracked arena in the benchmark address space.
pub const ARENA: usize = 0x40_0000;
/// Size of the tracked arena.
pub const ARENA_SIZE: usize = 0x10_0000;

/// A base, a derived class, an unrelated class and a container with a
/// member array, so each benchmark can pick the walk depth it needs.
pub const MANIFEST: &str = r#"{
  "types": [
    { "name": "class.Base", "size": 16,
      "fields": [ { "offset": 0, "type": "ptr" }, { "offset": 8, "type": "i64" } ] },
    { "name": "class.Derived", "size": 32,
      "fields": [ { "offset": 0, "type": "class.Base" }, { "offset": 16, "type": "i64" },
                  { "offset": 24, "type": "i64" } ] },
    { "name": "class.Other", "size": 16,
      "fields": [ { "offset": 0, "type": "i64" }, { "offset": 8, "type": "i64" } ] },
    { "name": "class.Holder", "size": 272,
      "fields": [ { "offset": 0, "type": "i64" },
                  { "offset": 16, "type": { "array": "class.Derived", "count": 8 } } ] }
  ]
}"#;

pub struct Fixture {
    pub loaded: LoadedManifest,
    pub runtime: Runtime,
}

impl Fixture {
    /// Runtime over a 32-bit synthetic address space with the arena tracked
    /// and every class registered. Reports go to memory.
    #[must_use]
    pub fn new() -> Self {
        let loaded = manifest::load_str(MANIFEST).expect("benchmark manifest loads");
        let shadow =
            ShadowTable::reserve(ShadowGeometry::new(32, 12)).expect("shadow table reserves");
        let config = RuntimeConfig::default().with_mode(CheckMode::Report);
        let runtime = Runtime::new(shadow, config, Box::new(MemorySink::new()));
        runtime
            .track_range(ARENA, ARENA_SIZE, 3)
            .expect("arena tracks");
        runtime.register_hierarchy(&Hierarchy::analyze(&loaded.table));
        Self { loaded, runtime }
    }

    /// Allocation record for `count` objects of `name` at `ptr`.
    #[must_use]
    pub fn record(&self, ptr: usize, name: &str, count: Option<u64>) -> AllocationRecord {
        let ty = self.loaded.type_id(name).expect("type in manifest");
        let mut builder = DescriptorBuilder::new(&self.loaded.table);
        let alloc = builder.allocation(ty, count).expect("type is tracked");
        let objects = count.unwrap_or(16);
        let mut record = AllocationRecord::new(
            ptr,
            DescriptorRef::from_allocation(&alloc),
            (alloc.element_size * objects) as usize,
        )
        .with_alignment(3);
        if let Some(n) = count {
            record = record.with_element_count(n);
        }
        record
    }

    /// Write the allocation at `ptr` into the shadow table.
    pub fn place(&self, ptr: usize, name: &str, count: Option<u64>) {
        let record = self.record(ptr, name, count);
        self.runtime
            .record_allocation(&record)
            .expect("arena covers the record");
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
