//! Manifest -> descriptors -> registration table, end to end.

use castguard_core::descriptor::{DescriptorEntry, DescriptorForm, END_MARKER};
use castguard_core::registration::{MERGE_FLAG, RegistrationTable};
use castguard_core::{DescriptorBuilder, Hierarchy, TypeHash, WalkOutcome, manifest};

const MANIFEST: &str = r#"{
  "types": [
    { "name": "class.Shape", "size": 16,
      "fields": [ { "offset": 0, "type": "ptr" }, { "offset": 8, "type": "i64" } ] },
    { "name": "class.Circle", "size": 24,
      "fields": [ { "offset": 0, "type": "class.Shape" }, { "offset": 16, "type": "double" } ] },
    { "name": "class.Tagged", "size": 16,
      "fields": [ { "offset": 0, "type": "class.Shape" } ] },
    { "name": "class.Scene", "size": 96,
      "fields": [ { "offset": 0, "type": "i64" },
                  { "offset": 8, "type": "class.Circle" },
                  { "offset": 32, "type": { "array": "class.Shape", "count": 4 } } ] }
  ]
}"#;

fn h(name: &str) -> TypeHash {
    TypeHash::of_name(name)
}

#[test]
fn scene_descriptor_flattens_members_and_arrays() {
    let loaded = manifest::load_str(MANIFEST).unwrap();
    let scene = loaded.type_id("class.Scene").unwrap();
    let shape = loaded.type_id("class.Shape").unwrap();
    let mut builder = DescriptorBuilder::new(&loaded.table);
    let desc = builder.descriptor(scene).unwrap();
    let shape_desc = builder.descriptor(shape).unwrap();

    assert_eq!(desc.words()[0], 96);
    assert_eq!(desc.entries(), vec![
        DescriptorEntry::Field {
            offset: 0,
            hash: h("class.Scene")
        },
        DescriptorEntry::Field {
            offset: 8,
            hash: h("class.Circle")
        },
        DescriptorEntry::Array {
            offset: 32,
            element: shape_desc.address()
        },
        DescriptorEntry::Gap { offset: 96 },
        DescriptorEntry::Terminator,
    ]);
    assert_eq!(*desc.words().last().unwrap(), END_MARKER);

    for (offset, expected) in [
        (0, WalkOutcome::Resolved(h("class.Scene"))),
        (8, WalkOutcome::Resolved(h("class.Circle"))),
        (32, WalkOutcome::Resolved(h("class.Shape"))),
        (80, WalkOutcome::Resolved(h("class.Shape"))),
        (16, WalkOutcome::UnknownOffset),
        (40, WalkOutcome::UnknownOffset),
    ] {
        assert_eq!(desc.resolve(DescriptorForm::Single, offset), expected, "offset {offset}");
    }
}

#[test]
fn registration_table_survives_the_wire() {
    let loaded = manifest::load_str(MANIFEST).unwrap();
    let hierarchy = Hierarchy::analyze(&loaded.table);
    let table = RegistrationTable::new(hierarchy.registration_entries());
    let words = table.encode();

    // Shape has a phantom child (Tagged), so it contributes a merge entry.
    let merge_headers = words.iter().filter(|w| **w & MERGE_FLAG != 0).count();
    assert!(merge_headers >= 1);

    let decoded = RegistrationTable::decode(table.len(), &words).unwrap();
    assert_eq!(decoded, table);

    let circle = decoded
        .entries
        .iter()
        .find(|e| e.class == h("class.Circle") && !e.merge)
        .unwrap();
    assert_eq!(circle.ancestors, vec![h("class.Shape")]);
    let shape_fake = decoded
        .entries
        .iter()
        .find(|e| e.class == h("class.Shape") && e.merge)
        .unwrap();
    assert_eq!(shape_fake.ancestors, vec![h("class.Tagged")]);
}

#[test]
fn dynamic_and_bounded_allocations_differ_only_past_the_end() {
    let loaded = manifest::load_str(MANIFEST).unwrap();
    let circle = loaded.type_id("class.Circle").unwrap();
    let mut builder = DescriptorBuilder::new(&loaded.table);
    let bounded = builder.allocation(circle, Some(3)).unwrap();
    let dynamic = builder.allocation(circle, None).unwrap();
    for offset in [0, 24, 48] {
        assert_eq!(bounded.resolve(offset), WalkOutcome::Resolved(h("class.Circle")));
        assert_eq!(dynamic.resolve(offset), WalkOutcome::Resolved(h("class.Circle")));
    }
    assert_eq!(bounded.resolve(72), WalkOutcome::UnknownOffset);
    assert_eq!(dynamic.resolve(72), WalkOutcome::Resolved(h("class.Circle")));
}
