//! Offset resolution over encoded descriptors.
//!
//! The walk is written against [`DescriptorSource`] so the same algorithm
//! runs over interned descriptors (safe, used by tooling and tests) and over
//! raw descriptor addresses read out of shadow memory (the runtime).

use crate::descriptor::{DescriptorEntry, END_MARKER};
use crate::hash::TypeHash;

/// Upper bound on entries visited by one resolution.
pub const MAX_WALK_STEPS: usize = 1 << 16;

/// Result of resolving an offset inside an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkOutcome {
    /// The subobject type starting exactly at the offset.
    Resolved(TypeHash),
    /// Allocation type is opted out of checking.
    Excluded,
    /// Allocation (or array element) type carries no hash.
    Untracked,
    /// No subobject starts at the offset.
    UnknownOffset,
}

/// Word-level access to encoded descriptors.
pub trait DescriptorSource {
    type Cursor: Copy;

    /// Read the word at `at`.
    fn read(&self, at: Self::Cursor) -> u64;

    /// Move `words` words forward.
    fn step(&self, at: Self::Cursor, words: usize) -> Self::Cursor;

    /// Cursor at the stride word of the element descriptor whose address is
    /// embedded in the array entry at `from`.
    fn element(&self, from: Self::Cursor, address: u64) -> Option<Self::Cursor>;
}

fn read_entry<S: DescriptorSource>(source: &S, at: S::Cursor) -> DescriptorEntry {
    let offset_word = source.read(at);
    if offset_word == END_MARKER {
        return DescriptorEntry::Terminator;
    }
    DescriptorEntry::decode(offset_word, source.read(source.step(at, 1)))
}

/// Resolve `offset` starting from a slot's descriptor address.
///
/// A nonzero first word is a stride (modulo form); zero is the root entry's
/// offset (single form).
pub fn walk<S: DescriptorSource>(source: &S, start: S::Cursor, offset: u64) -> WalkOutcome {
    let first = source.read(start);
    if first == END_MARKER {
        return WalkOutcome::Excluded;
    }
    let mut budget = MAX_WALK_STEPS;
    if first == 0 {
        walk_body(source, start, offset, &mut budget)
    } else {
        walk_body(source, source.step(start, 1), offset % first, &mut budget)
    }
}

fn walk_body<S: DescriptorSource>(
    source: &S,
    root: S::Cursor,
    offset: u64,
    budget: &mut usize,
) -> WalkOutcome {
    match read_entry(source, root) {
        DescriptorEntry::Terminator => return WalkOutcome::Excluded,
        DescriptorEntry::Untracked => return WalkOutcome::Untracked,
        DescriptorEntry::Field { offset: 0, hash } => {
            if offset == 0 {
                return WalkOutcome::Resolved(hash);
            }
        }
        _ => return WalkOutcome::UnknownOffset,
    }

    let mut cursor = source.step(root, 2);
    loop {
        if *budget == 0 {
            return WalkOutcome::UnknownOffset;
        }
        *budget -= 1;

        match read_entry(source, cursor) {
            DescriptorEntry::Field { offset: at, hash } => {
                if at == offset {
                    return WalkOutcome::Resolved(hash);
                }
                if at > offset {
                    return WalkOutcome::UnknownOffset;
                }
            }
            DescriptorEntry::Array { offset: at, element } => {
                if at > offset {
                    return WalkOutcome::UnknownOffset;
                }
                let next = source.step(cursor, 2);
                let end = read_entry(source, next).offset().unwrap_or(u64::MAX);
                if offset < end {
                    let Some(element) = source.element(cursor, element) else {
                        return WalkOutcome::UnknownOffset;
                    };
                    let stride = source.read(element);
                    if stride == 0 || stride == END_MARKER {
                        return WalkOutcome::UnknownOffset;
                    }
                    let inner = (offset - at) % stride;
                    return walk_body(source, source.step(element, 1), inner, budget);
                }
            }
            DescriptorEntry::Gap { offset: at } => {
                if at >= offset {
                    return WalkOutcome::UnknownOffset;
                }
            }
            DescriptorEntry::Untracked | DescriptorEntry::Terminator => {
                return WalkOutcome::UnknownOffset;
            }
        }
        cursor = source.step(cursor, 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ARRAY_TAG;

    /// Descriptors laid out in one vector; element addresses are word indices.
    struct Words(Vec<u64>);

    impl DescriptorSource for Words {
        type Cursor = usize;

        fn read(&self, at: usize) -> u64 {
            self.0.get(at).copied().unwrap_or(END_MARKER)
        }

        fn step(&self, at: usize, words: usize) -> usize {
            at + words
        }

        fn element(&self, _from: usize, address: u64) -> Option<usize> {
            usize::try_from(address).ok()
        }
    }

    // element C at [0..4): [16, 0, 0xC, MAX]
    // outer at [4..):      [64, 0, 0xA, 16|TAG, 0, 64, MAX, MAX]
    fn sample() -> Words {
        Words(vec![
            16, 0, 0xC, END_MARKER, // element
            64, 0, 0xA, 16 | ARRAY_TAG, 0, 64, END_MARKER, END_MARKER,
        ])
    }

    #[test]
    fn single_form_starts_at_root() {
        let w = sample();
        assert_eq!(walk(&w, 5, 0), WalkOutcome::Resolved(TypeHash(0xA)));
        assert_eq!(walk(&w, 5, 32), WalkOutcome::Resolved(TypeHash(0xC)));
        assert_eq!(walk(&w, 5, 64), WalkOutcome::UnknownOffset);
        assert_eq!(walk(&w, 5, 20), WalkOutcome::UnknownOffset);
    }

    #[test]
    fn modulo_form_reduces_offset() {
        let w = sample();
        assert_eq!(walk(&w, 0, 160), WalkOutcome::Resolved(TypeHash(0xC)));
        assert_eq!(walk(&w, 0, 161), WalkOutcome::UnknownOffset);
    }

    #[test]
    fn malformed_descriptor_is_bounded() {
        // Root followed by fields that never pass the target offset.
        let mut words = vec![0, 0xA];
        for _ in 0..(MAX_WALK_STEPS + 8) {
            words.extend([1, 0xB]);
        }
        let w = Words(words);
        assert_eq!(walk(&w, 0, u64::MAX - 1), WalkOutcome::UnknownOffset);
    }

    #[test]
    fn dangling_element_is_unknown() {
        let w = Words(vec![0, 0xA, 8 | ARRAY_TAG, 1000, 24, END_MARKER, END_MARKER]);
        assert_eq!(walk(&w, 0, 8), WalkOutcome::UnknownOffset);
    }
}
