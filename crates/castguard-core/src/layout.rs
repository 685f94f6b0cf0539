//! Type layout model.
//!
//! A [`TypeTable`] is an arena of scalar, struct and array types. Types are
//! appended in dependency order: a struct may only hold fields whose types
//! already exist in the table, so the by-value containment graph is acyclic
//! and every recursive walk over it terminates. Pointers are modeled as
//! scalars, which is how self-referential classes stay expressible.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{ANONYMOUS_TYPE_NAME, TypeHash, canonical_name};

/// Index of a type inside its [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a composite type takes part in cast checking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeClass {
    /// Class type that participates in hierarchy checks.
    #[default]
    Tracked,
    /// Opted out of checking; every cast involving it is accepted.
    Excluded,
    /// Aggregate from code that is not instrumented (plain C structs).
    Foreign,
}

impl TypeClass {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tracked" | "class" => Some(Self::Tracked),
            "excluded" | "ignored" | "blacklisted" => Some(Self::Excluded),
            "foreign" | "c" | "untracked" => Some(Self::Foreign),
            _ => None,
        }
    }
}

/// One by-value member of a struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u64,
    pub ty: TypeId,
}

impl Field {
    #[must_use]
    pub const fn new(offset: u64, ty: TypeId) -> Self {
        Self { offset, ty }
    }
}

/// A composite type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    /// `None` for literal/anonymous aggregates.
    pub name: Option<String>,
    pub class: TypeClass,
    /// Declared but never defined; has no size or fields.
    pub opaque: bool,
    pub size: u64,
    pub fields: Vec<Field>,
}

impl StructDef {
    /// Whether the name marks a compiler-emitted base-subobject layout.
    #[must_use]
    pub fn is_base_subobject(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.ends_with(crate::hash::BASE_SUFFIX))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Scalar { name: String, size: u64 },
    Struct(StructDef),
    Array { element: TypeId, count: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("type {0} is not defined in this table")]
    UnknownType(TypeId),
    #[error("field {index} of `{owner}` at offset {offset} (size {size}) exceeds struct size {struct_size}")]
    FieldOutOfBounds {
        owner: String,
        index: usize,
        offset: u64,
        size: u64,
        struct_size: u64,
    },
    #[error("field {index} of `{owner}` at offset {offset} precedes the previous field")]
    FieldsOutOfOrder {
        owner: String,
        index: usize,
        offset: u64,
    },
    #[error("array of {element} has zero elements")]
    EmptyArray { element: TypeId },
    #[error("array of {element} x {count} overflows the address space")]
    ArrayTooLarge { element: TypeId, count: u64 },
    #[error("type table is full")]
    TableFull,
}

/// Arena of types in dependency order.
#[derive(Debug, Default, Clone)]
pub struct TypeTable {
    types: Vec<TypeKind>,
}

impl TypeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn push(&mut self, kind: TypeKind) -> Result<TypeId, LayoutError> {
        let id = u32::try_from(self.types.len()).map_err(|_| LayoutError::TableFull)?;
        self.types.push(kind);
        Ok(TypeId(id))
    }

    fn check(&self, ty: TypeId) -> Result<(), LayoutError> {
        if ty.index() < self.types.len() {
            Ok(())
        } else {
            Err(LayoutError::UnknownType(ty))
        }
    }

    /// Add a scalar (integer, float, pointer, ...) type.
    pub fn add_scalar(&mut self, name: &str, size: u64) -> Result<TypeId, LayoutError> {
        self.push(TypeKind::Scalar {
            name: name.to_string(),
            size,
        })
    }

    /// Add a declared-only struct.
    pub fn add_opaque(&mut self, name: &str, class: TypeClass) -> Result<TypeId, LayoutError> {
        self.push(TypeKind::Struct(StructDef {
            name: Some(name.to_string()),
            class,
            opaque: true,
            size: 0,
            fields: Vec::new(),
        }))
    }

    /// Add a fully defined struct.
    ///
    /// Fields must reference types already in the table, lie inside `size`
    /// and appear in non-decreasing offset order.
    pub fn add_struct(
        &mut self,
        name: Option<&str>,
        class: TypeClass,
        size: u64,
        fields: Vec<Field>,
    ) -> Result<TypeId, LayoutError> {
        let owner = name.unwrap_or(ANONYMOUS_TYPE_NAME).to_string();
        let mut previous = 0u64;
        for (index, field) in fields.iter().enumerate() {
            self.check(field.ty)?;
            if field.offset < previous {
                return Err(LayoutError::FieldsOutOfOrder {
                    owner,
                    index,
                    offset: field.offset,
                });
            }
            let field_size = self.size_of(field.ty);
            let end = field.offset.checked_add(field_size);
            if end.is_none_or(|end| end > size) {
                return Err(LayoutError::FieldOutOfBounds {
                    owner,
                    index,
                    offset: field.offset,
                    size: field_size,
                    struct_size: size,
                });
            }
            previous = field.offset;
        }
        self.push(TypeKind::Struct(StructDef {
            name: name.map(str::to_string),
            class,
            opaque: false,
            size,
            fields,
        }))
    }

    /// Add a fixed-length array type.
    pub fn add_array(&mut self, element: TypeId, count: u64) -> Result<TypeId, LayoutError> {
        self.check(element)?;
        if count == 0 {
            return Err(LayoutError::EmptyArray { element });
        }
        if self.size_of(element).checked_mul(count).is_none() {
            return Err(LayoutError::ArrayTooLarge { element, count });
        }
        self.push(TypeKind::Array { element, count })
    }

    /// Look up a type. Ids are only minted by this table, so foreign ids are
    /// the only way to miss.
    #[must_use]
    pub fn get(&self, ty: TypeId) -> Option<&TypeKind> {
        self.types.get(ty.index())
    }

    #[must_use]
    pub fn as_struct(&self, ty: TypeId) -> Option<&StructDef> {
        match self.get(ty)? {
            TypeKind::Struct(def) => Some(def),
            _ => None,
        }
    }

    /// Size in bytes; opaque structs and unknown ids are zero-sized.
    #[must_use]
    pub fn size_of(&self, ty: TypeId) -> u64 {
        match self.get(ty) {
            Some(TypeKind::Scalar { size, .. }) => *size,
            Some(TypeKind::Struct(def)) => def.size,
            Some(TypeKind::Array { element, count }) => {
                self.size_of(*element).saturating_mul(*count)
            }
            None => 0,
        }
    }

    /// Fold nested arrays into `(innermost element, total count)`.
    ///
    /// Non-array types fold to themselves with a count of one.
    #[must_use]
    pub fn fold_array(&self, ty: TypeId) -> (TypeId, u64) {
        let mut current = ty;
        let mut total = 1u64;
        while let Some(TypeKind::Array { element, count }) = self.get(current) {
            total = total.saturating_mul(*count);
            current = *element;
        }
        (current, total)
    }

    /// Struct with a known body.
    ///
    /// Excluded structs count: as members they still occupy entries in the
    /// enclosing layout.
    #[must_use]
    pub fn is_interesting_struct(&self, ty: TypeId) -> bool {
        self.as_struct(ty).is_some_and(|def| !def.opaque)
    }

    /// Interesting struct, or an array whose innermost element is one.
    #[must_use]
    pub fn is_interesting(&self, ty: TypeId) -> bool {
        let (element, _) = self.fold_array(ty);
        self.is_interesting_struct(element)
    }

    /// Display name of a type (anonymous structs get a placeholder).
    #[must_use]
    pub fn display_name(&self, ty: TypeId) -> String {
        match self.get(ty) {
            Some(TypeKind::Scalar { name, .. }) => name.clone(),
            Some(TypeKind::Struct(def)) => def
                .name
                .clone()
                .unwrap_or_else(|| ANONYMOUS_TYPE_NAME.to_string()),
            Some(TypeKind::Array { element, count }) => {
                format!("[{count} x {}]", self.display_name(*element))
            }
            None => format!("<unknown {ty}>"),
        }
    }

    /// Hash under which instances of `ty` are checked, if it has one.
    ///
    /// Only named, defined, tracked structs carry a hash; everything else is
    /// stored as "no information".
    #[must_use]
    pub fn class_hash(&self, ty: TypeId) -> Option<TypeHash> {
        let def = self.as_struct(ty)?;
        if def.opaque || def.class != TypeClass::Tracked {
            return None;
        }
        def.name.as_deref().map(TypeHash::of_name)
    }

    /// Hash recorded for `ty` when it is embedded in another struct.
    ///
    /// Same as [`Self::class_hash`], except that a named excluded struct
    /// keeps its name hash so its offset still resolves.
    #[must_use]
    pub fn member_hash(&self, ty: TypeId) -> Option<TypeHash> {
        let def = self.as_struct(ty)?;
        if def.opaque {
            return None;
        }
        match def.class {
            TypeClass::Tracked | TypeClass::Excluded => def.name.as_deref().map(TypeHash::of_name),
            TypeClass::Foreign => None,
        }
    }

    /// Canonical name of a named struct.
    #[must_use]
    pub fn canonical_name(&self, ty: TypeId) -> Option<String> {
        self.as_struct(ty)?.name.as_deref().map(canonical_name)
    }

    /// Iterate over all ids in insertion (dependency) order.
    pub fn ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        (0..self.types.len()).map(|i| TypeId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (TypeTable, TypeId, TypeId) {
        let mut table = TypeTable::new();
        let i64_ty = table.add_scalar("i64", 8).unwrap();
        let a = table
            .add_struct(Some("class.A"), TypeClass::Tracked, 16, vec![
                Field::new(0, i64_ty),
                Field::new(8, i64_ty),
            ])
            .unwrap();
        (table, i64_ty, a)
    }

    #[test]
    fn struct_sizes_and_names() {
        let (table, i64_ty, a) = sample();
        assert_eq!(table.size_of(i64_ty), 8);
        assert_eq!(table.size_of(a), 16);
        assert_eq!(table.display_name(a), "class.A");
        assert!(table.is_interesting(a));
        assert!(!table.is_interesting(i64_ty));
    }

    #[test]
    fn nested_arrays_fold() {
        let (mut table, _, a) = sample();
        let inner = table.add_array(a, 3).unwrap();
        let outer = table.add_array(inner, 2).unwrap();
        assert_eq!(table.fold_array(outer), (a, 6));
        assert_eq!(table.size_of(outer), 96);
        assert!(table.is_interesting(outer));
        assert_eq!(table.display_name(outer), "[2 x [3 x class.A]]");
    }

    #[test]
    fn field_outside_struct_is_rejected() {
        let (mut table, i64_ty, _) = sample();
        let err = table
            .add_struct(Some("class.Bad"), TypeClass::Tracked, 8, vec![Field::new(4, i64_ty)])
            .unwrap_err();
        assert!(matches!(err, LayoutError::FieldOutOfBounds { index: 0, .. }));
    }

    #[test]
    fn fields_must_be_ordered() {
        let (mut table, i64_ty, _) = sample();
        let err = table
            .add_struct(Some("class.Bad"), TypeClass::Tracked, 16, vec![
                Field::new(8, i64_ty),
                Field::new(0, i64_ty),
            ])
            .unwrap_err();
        assert!(matches!(err, LayoutError::FieldsOutOfOrder { index: 1, .. }));
    }

    #[test]
    fn unknown_and_empty_types_are_rejected() {
        let (mut table, _, a) = sample();
        assert_eq!(
            table.add_array(TypeId(99), 2),
            Err(LayoutError::UnknownType(TypeId(99)))
        );
        assert_eq!(table.add_array(a, 0), Err(LayoutError::EmptyArray { element: a }));
    }

    #[test]
    fn only_named_tracked_structs_have_hashes() {
        let (mut table, i64_ty, a) = sample();
        let anon = table
            .add_struct(None, TypeClass::Tracked, 8, vec![Field::new(0, i64_ty)])
            .unwrap();
        let c = table
            .add_struct(Some("struct.stat"), TypeClass::Foreign, 8, vec![Field::new(0, i64_ty)])
            .unwrap();
        let opaque = table.add_opaque("class.Fwd", TypeClass::Tracked).unwrap();
        assert_eq!(table.class_hash(a), Some(TypeHash::of_name("class.A")));
        assert_eq!(table.class_hash(anon), None);
        assert_eq!(table.class_hash(c), None);
        assert_eq!(table.class_hash(opaque), None);
        assert!(!table.is_interesting(opaque));
    }

    #[test]
    fn excluded_structs_keep_a_member_hash_only() {
        let (mut table, i64_ty, _) = sample();
        let ex = table
            .add_struct(Some("class.std::mutex"), TypeClass::Excluded, 8, vec![
                Field::new(0, i64_ty),
            ])
            .unwrap();
        let foreign = table
            .add_struct(Some("struct.stat"), TypeClass::Foreign, 8, vec![Field::new(0, i64_ty)])
            .unwrap();
        assert!(table.is_interesting(ex));
        assert_eq!(table.class_hash(ex), None);
        assert_eq!(table.member_hash(ex), Some(TypeHash::of_name("class.std::mutex")));
        assert_eq!(table.member_hash(foreign), None);
        let opaque = table.add_opaque("class.Fwd", TypeClass::Excluded).unwrap();
        assert_eq!(table.member_hash(opaque), None);
    }

    #[test]
    fn type_class_parsing() {
        assert_eq!(TypeClass::from_str_loose("TRACKED"), Some(TypeClass::Tracked));
        assert_eq!(TypeClass::from_str_loose("excluded"), Some(TypeClass::Excluded));
        assert_eq!(TypeClass::from_str_loose("foreign"), Some(TypeClass::Foreign));
        assert_eq!(TypeClass::from_str_loose("bogus"), None);
    }
}
