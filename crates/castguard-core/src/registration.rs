//! Registration table wire format.
//!
//! Each module hands the runtime one flat table of 64-bit words made of
//! `count` entries:
//!
//! ```text
//! [hash_count | flags, class_hash, ancestor_0, ..., ancestor_{hash_count-2}]
//! ```
//!
//! `hash_count` counts the class hash itself plus its ancestors. Bit 31 of
//! the header ([`MERGE_FLAG`]) asks the registry to union the ancestors
//! into an existing entry instead of skipping a class it already knows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::TypeHash;

/// Header bit requesting a merge into an existing registry entry.
pub const MERGE_FLAG: u64 = 1 << 31;

/// Header bits holding the hash count.
pub const COUNT_MASK: u64 = MERGE_FLAG - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("entry {entry} declares zero hashes")]
    EmptyEntry { entry: usize },
    #[error("entry {entry} needs {needed} words but only {available} remain")]
    Truncated {
        entry: usize,
        needed: usize,
        available: usize,
    },
}

/// Hash count of a header word.
#[must_use]
pub const fn header_count(header: u64) -> u64 {
    header & COUNT_MASK
}

/// Whether a header requests a merge.
///
/// Producers that built the header in a signed 32-bit integer sign-extend
/// the flag into the upper half, so any bit at or above 31 counts.
#[must_use]
pub const fn header_merges(header: u64) -> bool {
    header >> 31 != 0
}

/// One class and the ancestors it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub class: TypeHash,
    pub ancestors: Vec<TypeHash>,
    pub merge: bool,
}

impl RegistrationEntry {
    #[must_use]
    pub fn new(class: TypeHash, ancestors: Vec<TypeHash>) -> Self {
        Self {
            class,
            ancestors,
            merge: false,
        }
    }

    #[must_use]
    pub fn merging(class: TypeHash, ancestors: Vec<TypeHash>) -> Self {
        Self {
            class,
            ancestors,
            merge: true,
        }
    }

    /// Words this entry occupies on the wire.
    #[must_use]
    pub fn width(&self) -> usize {
        2 + self.ancestors.len()
    }

    pub fn encode(&self, out: &mut Vec<u64>) {
        let mut header = (self.ancestors.len() as u64 + 1) & COUNT_MASK;
        if self.merge {
            header |= MERGE_FLAG;
        }
        out.push(header);
        out.push(self.class.get());
        out.extend(self.ancestors.iter().map(|h| h.get()));
    }
}

/// Total words spanned by `count` entries, reading headers through `read`.
///
/// Used where the table length is not known up front; `read` is only asked
/// for header words, each after the previous entry has been accounted for.
pub fn scan_len(count: usize, mut read: impl FnMut(usize) -> u64) -> Result<usize, RegistrationError> {
    let mut pos = 0usize;
    for entry in 0..count {
        let hashes = header_count(read(pos));
        if hashes == 0 {
            return Err(RegistrationError::EmptyEntry { entry });
        }
        pos = pos.saturating_add(1).saturating_add(hashes as usize);
    }
    Ok(pos)
}

/// Decoded form of one module's table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationTable {
    pub entries: Vec<RegistrationEntry>,
}

impl RegistrationTable {
    #[must_use]
    pub fn new(entries: Vec<RegistrationEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.entries.iter().map(RegistrationEntry::width).sum());
        for entry in &self.entries {
            entry.encode(&mut out);
        }
        out
    }

    /// Decode `count` entries from the front of `words`.
    pub fn decode(count: usize, words: &[u64]) -> Result<Self, RegistrationError> {
        let mut entries = Vec::with_capacity(count);
        let mut pos = 0usize;
        for entry in 0..count {
            let Some(&header) = words.get(pos) else {
                return Err(RegistrationError::Truncated {
                    entry,
                    needed: 2,
                    available: 0,
                });
            };
            let hashes = header_count(header) as usize;
            if hashes == 0 {
                return Err(RegistrationError::EmptyEntry { entry });
            }
            let available = words.len() - pos - 1;
            if hashes > available {
                return Err(RegistrationError::Truncated {
                    entry,
                    needed: hashes + 1,
                    available: available + 1,
                });
            }
            let body = &words[pos + 1..pos + 1 + hashes];
            entries.push(RegistrationEntry {
                class: TypeHash(body[0]),
                ancestors: body[1..].iter().copied().map(TypeHash).collect(),
                merge: header_merges(header),
            });
            pos += 1 + hashes;
        }
        Ok(Self { entries })
    }
}
