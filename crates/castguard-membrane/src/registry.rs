//! Process-wide class hash registry.
//!
//! Maps a class hash to the set of hashes a pointer to that class may be
//! cast to: its real bases plus the phantom (empty-derived) classes that
//! share its layout. Built from per-module registration tables; merges only
//! ever grow a set.

use std::collections::{HashMap, HashSet};

use castguard_core::{RegistrationEntry, RegistrationTable, TypeHash};
use parking_lot::RwLock;

use crate::metrics::CastMetrics;

/// Ancestor hashes in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncestorSet {
    order: Vec<TypeHash>,
    members: HashSet<TypeHash>,
}

impl AncestorSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `hash`; false if already present.
    pub fn insert(&mut self, hash: TypeHash) -> bool {
        if self.members.insert(hash) {
            self.order.push(hash);
            true
        } else {
            false
        }
    }

    pub fn extend(&mut self, hashes: impl IntoIterator<Item = TypeHash>) {
        for hash in hashes {
            self.insert(hash);
        }
    }

    #[must_use]
    pub fn contains(&self, hash: TypeHash) -> bool {
        self.members.contains(&hash)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[TypeHash] {
        &self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<TypeHash> for AncestorSet {
    fn from_iter<I: IntoIterator<Item = TypeHash>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Outcome of merging one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Classes seen for the first time.
    pub added: usize,
    /// Known classes whose set was unioned.
    pub merged: usize,
    /// Known classes without the merge flag, plus hashless entries.
    pub skipped: usize,
}

/// Answer to "may `resolved` be viewed as `target`?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestorCheck {
    Ancestor,
    NotAncestor,
    /// `resolved` was never registered.
    UnknownHash,
}

#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<TypeHash, AncestorSet>>,
    names: RwLock<HashMap<TypeHash, String>>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge decoded entries under one write lock.
    pub fn merge_entries(&self, entries: &[RegistrationEntry], metrics: &CastMetrics) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut classes = self.classes.write();
        for entry in entries {
            if entry.class.is_no_info() {
                summary.skipped += 1;
                continue;
            }
            match classes.get_mut(&entry.class) {
                None => {
                    classes.insert(entry.class, entry.ancestors.iter().copied().collect());
                    summary.added += 1;
                }
                Some(set) if entry.merge => {
                    set.extend(entry.ancestors.iter().copied());
                    summary.merged += 1;
                }
                Some(_) => summary.skipped += 1,
            }
        }
        drop(classes);

        CastMetrics::inc(&metrics.registry_merges);
        CastMetrics::add(&metrics.registry_entries_added, summary.added as u64);
        CastMetrics::add(&metrics.registry_entries_merged, summary.merged as u64);
        CastMetrics::add(&metrics.registry_entries_skipped, summary.skipped as u64);
        summary
    }

    pub fn merge_table(&self, table: &RegistrationTable, metrics: &CastMetrics) -> MergeSummary {
        self.merge_entries(&table.entries, metrics)
    }

    #[must_use]
    pub fn check(&self, resolved: TypeHash, target: TypeHash) -> AncestorCheck {
        match self.classes.read().get(&resolved) {
            None => AncestorCheck::UnknownHash,
            Some(set) if set.contains(target) => AncestorCheck::Ancestor,
            Some(_) => AncestorCheck::NotAncestor,
        }
    }

    #[must_use]
    pub fn contains(&self, class: TypeHash) -> bool {
        self.classes.read().contains_key(&class)
    }

    /// Copy of the ancestor list for `class`.
    #[must_use]
    pub fn ancestors(&self, class: TypeHash) -> Option<Vec<TypeHash>> {
        self.classes.read().get(&class).map(|set| set.as_slice().to_vec())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    /// Remember a display name for diagnostics. The first name wins.
    pub fn register_name(&self, hash: TypeHash, name: impl Into<String>) {
        self.names.write().entry(hash).or_insert_with(|| name.into());
    }

    #[must_use]
    pub fn name_of(&self, hash: TypeHash) -> Option<String> {
        self.names.read().get(&hash).cloned()
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.len())
            .field("names", &self.names.read().len())
            .finish()
    }
}
