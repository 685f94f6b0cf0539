//! Type descriptors: flattened offset tables of composite types.
//!
//! A descriptor is a run of 64-bit words shared verbatim between the
//! instrumentation stage and the runtime:
//!
//! ```text
//! [stride]                       element size in bytes
//! [0, root_hash]                 root entry
//! [offset, hash]                 member subobject
//! [offset | ARRAY_TAG, element]  array of subobjects, element = address of
//!                                the element descriptor's stride word
//! [end, END_MARKER]              gap closing the preceding array
//! [END_MARKER]                   terminator
//! ```
//!
//! Excluded types encode as `[size, END_MARKER]`, types without a usable
//! hash as `[size, 0, END_MARKER, END_MARKER]`. Shadow slots hold either the
//! address of the stride word (modulo form: the checked offset is reduced
//! modulo the stride first) or of the root entry (single form).
//!
//! Descriptors are interned per type for the lifetime of the process and
//! never freed, so their word addresses stay valid for every shadow slot
//! that captured them.

use std::collections::HashMap;
use std::marker::PhantomData;

use crate::hash::TypeHash;
use crate::layout::{TypeClass, TypeId, TypeKind, TypeTable};
use crate::walk::{self, DescriptorSource, WalkOutcome};

/// Set on the offset word of an array entry.
pub const ARRAY_TAG: u64 = 1 << 63;

/// Terminator word, and the payload of gap and untracked entries.
pub const END_MARKER: u64 = u64::MAX;

/// Typed view of one descriptor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorEntry {
    Field { offset: u64, hash: TypeHash },
    Array { offset: u64, element: u64 },
    Gap { offset: u64 },
    /// Root of a type without hash information.
    Untracked,
    Terminator,
}

impl DescriptorEntry {
    /// Decode an entry from its offset word and the word after it.
    ///
    /// `payload` is ignored when `offset_word` is the terminator.
    #[must_use]
    pub const fn decode(offset_word: u64, payload: u64) -> Self {
        if offset_word == END_MARKER {
            return Self::Terminator;
        }
        if offset_word & ARRAY_TAG != 0 {
            return Self::Array {
                offset: offset_word & !ARRAY_TAG,
                element: payload,
            };
        }
        if payload == END_MARKER {
            return if offset_word == 0 {
                Self::Untracked
            } else {
                Self::Gap {
                    offset: offset_word,
                }
            };
        }
        Self::Field {
            offset: offset_word,
            hash: TypeHash(payload),
        }
    }

    pub fn encode(&self, out: &mut Vec<u64>) {
        match *self {
            Self::Field { offset, hash } => out.extend([offset, hash.get()]),
            Self::Array { offset, element } => out.extend([offset | ARRAY_TAG, element]),
            Self::Gap { offset } => out.extend([offset, END_MARKER]),
            Self::Untracked => out.extend([0, END_MARKER]),
            Self::Terminator => out.push(END_MARKER),
        }
    }

    /// Number of words the entry occupies.
    #[must_use]
    pub const fn width(&self) -> usize {
        match self {
            Self::Terminator => 1,
            _ => 2,
        }
    }

    #[must_use]
    pub const fn offset(&self) -> Option<u64> {
        match *self {
            Self::Field { offset, .. } | Self::Array { offset, .. } | Self::Gap { offset } => {
                Some(offset)
            }
            Self::Untracked => Some(0),
            Self::Terminator => None,
        }
    }
}

/// Which word of a descriptor a shadow slot points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorForm {
    /// Points at the root entry: one object (or a bounded array descriptor).
    Single,
    /// Points at the stride word: array of unknown length.
    Modulo,
}

impl DescriptorForm {
    #[must_use]
    pub const fn word_offset(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Modulo => 0,
        }
    }
}

/// Interning key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKey {
    Struct(TypeId),
    /// `count` contiguous elements allocated as one object.
    BoundedArray { element: TypeId, count: u64 },
}

/// How the root of a descriptor behaves under verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorShape {
    Tracked(TypeHash),
    /// Opted out of checking.
    Excluded,
    /// Foreign or anonymous type; carries no hash.
    Untracked,
}

/// One interned descriptor.
#[derive(Debug)]
pub struct Descriptor {
    key: DescriptorKey,
    name: String,
    shape: DescriptorShape,
    stride: u64,
    words: &'static [u64],
    elements: Vec<&'static Descriptor>,
}

impl Descriptor {
    #[must_use]
    pub const fn key(&self) -> DescriptorKey {
        self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn shape(&self) -> DescriptorShape {
        self.shape
    }

    #[must_use]
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    #[must_use]
    pub const fn words(&self) -> &'static [u64] {
        self.words
    }

    /// Element descriptors referenced by array entries.
    #[must_use]
    pub fn elements(&self) -> &[&'static Descriptor] {
        &self.elements
    }

    /// Address of the stride word, as embedded in array entries.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    /// Address stored in a shadow slot for the given form.
    #[must_use]
    pub fn slot_address(&self, form: DescriptorForm) -> usize {
        self.words.as_ptr() as usize + form.word_offset() * size_of::<u64>()
    }

    /// Typed entries after the stride word, terminator included.
    #[must_use]
    pub fn entries(&self) -> Vec<DescriptorEntry> {
        let mut out = Vec::new();
        let mut i = 1;
        while i < self.words.len() {
            let payload = self.words.get(i + 1).copied().unwrap_or(END_MARKER);
            let entry = DescriptorEntry::decode(self.words[i], payload);
            out.push(entry);
            if entry == DescriptorEntry::Terminator {
                break;
            }
            i += entry.width();
        }
        out
    }

    /// Resolve the subobject type at `offset` without touching raw memory.
    #[must_use]
    pub fn resolve(&self, form: DescriptorForm, offset: u64) -> WalkOutcome {
        walk::walk(&InternedSource(PhantomData), (self, form.word_offset()), offset)
    }
}

/// Walks interned descriptors through their element lists.
struct InternedSource<'a>(PhantomData<&'a Descriptor>);

impl<'a> DescriptorSource for InternedSource<'a> {
    type Cursor = (&'a Descriptor, usize);

    fn read(&self, (descriptor, index): Self::Cursor) -> u64 {
        descriptor.words.get(index).copied().unwrap_or(END_MARKER)
    }

    fn step(&self, (descriptor, index): Self::Cursor, words: usize) -> Self::Cursor {
        (descriptor, index + words)
    }

    fn element(&self, (descriptor, _): Self::Cursor, address: u64) -> Option<Self::Cursor> {
        descriptor
            .elements
            .iter()
            .find(|e| e.address() == address)
            .map(|e| (*e, 0))
    }
}

/// What the write path installs for one allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationDescriptor {
    pub descriptor: &'static Descriptor,
    pub form: DescriptorForm,
    /// Element type has no name; stored base is null so reads see no metadata.
    pub anonymous: bool,
    pub element: TypeId,
    pub element_size: u64,
    /// Total element count when statically known.
    pub element_count: Option<u64>,
}

impl AllocationDescriptor {
    #[must_use]
    pub fn slot_address(&self) -> usize {
        self.descriptor.slot_address(self.form)
    }

    #[must_use]
    pub fn resolve(&self, offset: u64) -> WalkOutcome {
        self.descriptor.resolve(self.form, offset)
    }
}

#[derive(Debug, Clone, Copy)]
enum Flat {
    Field {
        offset: u64,
        hash: TypeHash,
    },
    Array {
        offset: u64,
        element: &'static Descriptor,
        count: u64,
    },
}

impl Flat {
    const fn offset(&self) -> u64 {
        match *self {
            Self::Field { offset, .. } | Self::Array { offset, .. } => offset,
        }
    }
}

/// Builds and interns descriptors for the types of one [`TypeTable`].
pub struct DescriptorBuilder<'t> {
    table: &'t TypeTable,
    interned: HashMap<DescriptorKey, &'static Descriptor>,
    by_address: HashMap<u64, &'static Descriptor>,
    builds: usize,
}

impl<'t> DescriptorBuilder<'t> {
    #[must_use]
    pub fn new(table: &'t TypeTable) -> Self {
        Self {
            table,
            interned: HashMap::new(),
            by_address: HashMap::new(),
            builds: 0,
        }
    }

    #[must_use]
    pub const fn table(&self) -> &'t TypeTable {
        self.table
    }

    /// Number of descriptors constructed so far (cache hits excluded).
    #[must_use]
    pub const fn build_count(&self) -> usize {
        self.builds
    }

    /// Interned descriptor whose stride word lives at `address`.
    #[must_use]
    pub fn find_by_address(&self, address: u64) -> Option<&'static Descriptor> {
        self.by_address.get(&address).copied()
    }

    /// Descriptor of a defined struct type; `None` for anything else.
    pub fn descriptor(&mut self, ty: TypeId) -> Option<&'static Descriptor> {
        if let Some(found) = self.interned.get(&DescriptorKey::Struct(ty)).copied() {
            return Some(found);
        }
        let table = self.table;
        let def = table.as_struct(ty)?;
        if def.opaque {
            return None;
        }
        let size = def.size;
        let name = table.display_name(ty);
        let key = DescriptorKey::Struct(ty);
        let built = if def.class == TypeClass::Excluded {
            let words = vec![size, END_MARKER];
            self.intern(key, name, DescriptorShape::Excluded, size, words, Vec::new())
        } else if let Some(hash) = table.class_hash(ty) {
            let mut flat = Vec::new();
            self.inline_struct(ty, 0, false, &mut flat);
            let (words, elements) = encode(size, hash, flat);
            self.intern(key, name, DescriptorShape::Tracked(hash), size, words, elements)
        } else {
            let words = vec![size, 0, END_MARKER, END_MARKER];
            self.intern(key, name, DescriptorShape::Untracked, size, words, Vec::new())
        };
        Some(built)
    }

    /// Descriptor for a fixed-count array allocated as a single object.
    fn bounded_array(&mut self, element: TypeId, count: u64) -> Option<&'static Descriptor> {
        let key = DescriptorKey::BoundedArray { element, count };
        if let Some(found) = self.interned.get(&key).copied() {
            return Some(found);
        }
        let element_desc = self.descriptor(element)?;
        let DescriptorShape::Tracked(hash) = element_desc.shape else {
            return None;
        };
        let size = element_desc.stride;
        let total = size.checked_mul(count)?;
        let mut flat = Vec::new();
        self.inline_struct(element, 0, false, &mut flat);
        flat.push(Flat::Array {
            offset: size,
            element: element_desc,
            count: count - 1,
        });
        let (words, elements) = encode(total, hash, flat);
        let name = format!("[{count} x {}]", element_desc.name);
        Some(self.intern(key, name, DescriptorShape::Tracked(hash), total, words, elements))
    }

    /// Choose the descriptor and form to record for an allocation of `ty`.
    ///
    /// `count` is the number of `ty` objects when statically known; `None`
    /// marks a dynamically sized array. Returns `None` when the type is not
    /// worth instrumenting.
    pub fn allocation(&mut self, ty: TypeId, count: Option<u64>) -> Option<AllocationDescriptor> {
        let table = self.table;
        let (element, per_object) = table.fold_array(ty);
        let def = table.as_struct(element)?;
        if def.opaque {
            return None;
        }
        let anonymous = def.name.is_none();
        let element_desc = self.descriptor(element)?;
        let element_size = element_desc.stride;
        let total = count.map(|c| c.saturating_mul(per_object));
        let tracked = matches!(element_desc.shape, DescriptorShape::Tracked(_));

        let (descriptor, form) = match total {
            Some(0 | 1) => (element_desc, DescriptorForm::Single),
            Some(n) if tracked && element_size > 0 => {
                (self.bounded_array(element, n)?, DescriptorForm::Single)
            }
            _ if element_size == 0 => (element_desc, DescriptorForm::Single),
            _ => (element_desc, DescriptorForm::Modulo),
        };

        Some(AllocationDescriptor {
            descriptor,
            form,
            anonymous,
            element,
            element_size,
            element_count: total,
        })
    }

    fn intern(
        &mut self,
        key: DescriptorKey,
        name: String,
        shape: DescriptorShape,
        stride: u64,
        words: Vec<u64>,
        elements: Vec<&'static Descriptor>,
    ) -> &'static Descriptor {
        let words: &'static [u64] = Box::leak(words.into_boxed_slice());
        let descriptor: &'static Descriptor = Box::leak(Box::new(Descriptor {
            key,
            name,
            shape,
            stride,
            words,
            elements,
        }));
        self.builds += 1;
        self.interned.insert(key, descriptor);
        self.by_address.insert(descriptor.address(), descriptor);
        descriptor
    }

    /// Append the entries of struct `ty` placed at `at`.
    ///
    /// `emit_root` is false when `ty` sits at offset zero of its enclosing
    /// struct; the enclosing root already covers that address.
    fn inline_struct(&mut self, ty: TypeId, at: u64, emit_root: bool, out: &mut Vec<Flat>) {
        let table = self.table;
        let Some(def) = table.as_struct(ty) else {
            return;
        };
        if emit_root {
            if let Some(hash) = table.member_hash(ty) {
                out.push(Flat::Field { offset: at, hash });
            }
        }
        for field in &def.fields {
            self.inline_member(field.ty, at + field.offset, field.offset != 0, out);
        }
    }

    fn inline_member(&mut self, ty: TypeId, at: u64, emit_root: bool, out: &mut Vec<Flat>) {
        if !self.table.is_interesting(ty) {
            return;
        }
        if !matches!(self.table.get(ty), Some(TypeKind::Array { .. })) {
            self.inline_struct(ty, at, emit_root, out);
            return;
        }
        let (element, count) = self.table.fold_array(ty);
        if count == 1 {
            self.inline_struct(element, at, emit_root, out);
            return;
        }
        let Some(element_desc) = self.descriptor(element) else {
            return;
        };
        let size = element_desc.stride;
        if size == 0 {
            return;
        }
        if emit_root {
            out.push(Flat::Array {
                offset: at,
                element: element_desc,
                count,
            });
        } else {
            self.inline_struct(element, at, false, out);
            out.push(Flat::Array {
                offset: at + size,
                element: element_desc,
                count: count - 1,
            });
        }
    }
}

/// Encode a tracked descriptor, closing every array with a gap unless the
/// next entry starts exactly where the array ends.
fn encode(stride: u64, root: TypeHash, mut flat: Vec<Flat>) -> (Vec<u64>, Vec<&'static Descriptor>) {
    flat.sort_by_key(Flat::offset);
    let mut words = vec![stride];
    let mut elements: Vec<&'static Descriptor> = Vec::new();
    DescriptorEntry::Field {
        offset: 0,
        hash: root,
    }
    .encode(&mut words);
    for (i, entry) in flat.iter().enumerate() {
        match *entry {
            Flat::Field { offset, hash } => {
                DescriptorEntry::Field { offset, hash }.encode(&mut words);
            }
            Flat::Array {
                offset,
                element,
                count,
            } => {
                DescriptorEntry::Array {
                    offset,
                    element: element.address(),
                }
                .encode(&mut words);
                if !elements.iter().any(|e| std::ptr::eq(*e, element)) {
                    elements.push(element);
                }
                let end = offset.saturating_add(element.stride.saturating_mul(count));
                let next = flat.get(i + 1).map(Flat::offset);
                if next.is_none_or(|next| next > end) {
                    DescriptorEntry::Gap { offset: end }.encode(&mut words);
                }
            }
        }
    }
    DescriptorEntry::Terminator.encode(&mut words);
    (words, elements)
}
