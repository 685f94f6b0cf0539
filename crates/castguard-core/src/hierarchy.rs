//! Class hierarchy analysis.
//!
//! Only the first member of a class can be its (primary) base: a named,
//! defined struct stored at offset zero. Secondary bases are not ancestors;
//! they are reached through exact offset matches in the flattened
//! descriptor instead.
//!
//! A class whose only member is its base adds no storage of its own (an
//! empty derived class), so a pointer to the base and a pointer to the
//! derived class cannot be told apart in memory. Such a *phantom* child is
//! recorded on its parent as a fake ancestor, and fake ancestors are then
//! propagated in two sweeps: bottom-up from phantom children into their
//! parents, then top-down from every parent into all of its children.

use std::collections::{HashMap, HashSet};

use crate::hash::TypeHash;
use crate::layout::{TypeClass, TypeId, TypeTable};
use crate::registration::RegistrationEntry;

/// Per-class ancestry facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ty: TypeId,
    pub name: String,
    pub hash: TypeHash,
    pub class: TypeClass,
    pub parent: Option<TypeId>,
    /// Real ancestors, nearest first.
    pub real: Vec<TypeHash>,
    /// Fake ancestors from phantom (empty-derived) relationships.
    pub fake: Vec<TypeHash>,
    pub phantom_children: Vec<TypeId>,
}

impl ClassInfo {
    /// Whether `hash` is a real or fake ancestor.
    #[must_use]
    pub fn has_ancestor(&self, hash: TypeHash) -> bool {
        self.real.contains(&hash) || self.fake.contains(&hash)
    }
}

/// Ancestry of every named class in a type table.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    classes: Vec<ClassInfo>,
    index: HashMap<TypeId, usize>,
}

/// Append the hashes of `extra` missing from `into`, keeping first-seen order.
fn union_into(into: &mut Vec<TypeHash>, extra: &[TypeHash]) {
    let mut seen: HashSet<TypeHash> = into.iter().copied().collect();
    for hash in extra {
        if seen.insert(*hash) {
            into.push(*hash);
        }
    }
}

impl Hierarchy {
    /// Analyze all named, defined structs of `table`.
    ///
    /// Fields always reference earlier ids, so a parent is analyzed before
    /// any of its children and the two propagation sweeps are single passes
    /// in id order.
    #[must_use]
    pub fn analyze(table: &TypeTable) -> Self {
        let mut hierarchy = Self::default();

        for ty in table.ids() {
            let Some(def) = table.as_struct(ty) else {
                continue;
            };
            let Some(name) = def.name.as_deref() else {
                continue;
            };
            if def.opaque {
                continue;
            }

            let parent = def
                .fields
                .first()
                .filter(|f| f.offset == 0)
                .map(|f| f.ty)
                .filter(|p| hierarchy.index.contains_key(p));

            let mut real = Vec::new();
            if let Some(p) = parent.and_then(|p| hierarchy.class(p)) {
                real.push(p.hash);
                union_into(&mut real, &p.real);
            }

            let info = ClassInfo {
                ty,
                name: name.to_string(),
                hash: TypeHash::of_name(name),
                class: def.class,
                parent,
                real,
                fake: Vec::new(),
                phantom_children: Vec::new(),
            };
            let hash = info.hash;
            hierarchy.index.insert(ty, hierarchy.classes.len());
            hierarchy.classes.push(info);

            if let Some(p) = parent {
                if def.fields.len() == 1 {
                    if let Some(parent_info) = hierarchy.class_mut(p) {
                        parent_info.phantom_children.push(ty);
                        union_into(&mut parent_info.fake, &[hash]);
                    }
                }
            }
        }

        // Bottom-up: children have larger ids, so reverse order sees every
        // phantom child's final set before its parent pulls it.
        for i in (0..hierarchy.classes.len()).rev() {
            let children = hierarchy.classes[i].phantom_children.clone();
            for child in children {
                let pulled = hierarchy.class(child).map(|c| c.fake.clone()).unwrap_or_default();
                union_into(&mut hierarchy.classes[i].fake, &pulled);
            }
        }

        // Top-down: parents come first.
        for i in 0..hierarchy.classes.len() {
            let Some(parent) = hierarchy.classes[i].parent else {
                continue;
            };
            let pulled = hierarchy.class(parent).map(|p| p.fake.clone()).unwrap_or_default();
            union_into(&mut hierarchy.classes[i].fake, &pulled);
        }

        hierarchy
    }

    #[must_use]
    pub fn class(&self, ty: TypeId) -> Option<&ClassInfo> {
        self.index.get(&ty).map(|&i| &self.classes[i])
    }

    fn class_mut(&mut self, ty: TypeId) -> Option<&mut ClassInfo> {
        let i = *self.index.get(&ty)?;
        self.classes.get_mut(i)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Registration entries for every tracked class.
    ///
    /// Base-subobject layouts hash like their class and are not emitted.
    /// A class with fake ancestors contributes a second entry flagged for
    /// merging into the first.
    #[must_use]
    pub fn registration_entries(&self) -> Vec<RegistrationEntry> {
        let mut entries = Vec::new();
        for info in &self.classes {
            if info.class != TypeClass::Tracked || info.name.ends_with(crate::hash::BASE_SUFFIX) {
                continue;
            }
            entries.push(RegistrationEntry::new(info.hash, info.real.clone()));
            if !info.fake.is_empty() {
                entries.push(RegistrationEntry::merging(info.hash, info.fake.clone()));
            }
        }
        entries
    }
}
