//! JSON layout manifests.
//!
//! A manifest lists struct layouts by name so tooling can rebuild a
//! [`TypeTable`] without a compiler in the loop:
//!
//! ```json
//! {
//!   "types": [
//!     { "name": "class.Base", "size": 16,
//!       "fields": [ { "offset": 0, "type": "ptr" }, { "offset": 8, "type": "i64" } ] },
//!     { "name": "class.Derived", "size": 80,
//!       "fields": [ { "offset": 0, "type": "class.Base" },
//!                   { "offset": 16, "type": { "array": "class.Base", "count": 4 } } ] },
//!     { "name": "class.Fwd", "opaque": true },
//!     { "key": "anon.0", "size": 8, "fields": [ { "offset": 0, "type": "i64" } ] }
//!   ]
//! }
//! ```
//!
//! Structs may be listed in any order; the loader inserts them into the
//! table in dependency order and rejects by-value cycles.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{Field, LayoutError, TypeClass, TypeId, TypeTable};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("type entry {index} has neither a name nor a key")]
    MissingKey { index: usize },
    #[error("type `{0}` is defined more than once")]
    DuplicateType(String),
    #[error("type `{0}` is referenced but never defined")]
    UnknownType(String),
    #[error("opaque type entry {index} must be named")]
    UnnamedOpaque { index: usize },
    #[error("type `{0}` contains itself by value")]
    Cycle(String),
    #[error("type `{name}`: {source}")]
    Layout {
        name: String,
        #[source]
        source: LayoutError,
    },
}

/// Reference to a field type: a scalar or struct name, or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRef {
    Named(String),
    Array { array: Box<TypeRef>, count: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub offset: u64,
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructSpec {
    /// Type name; absent for anonymous aggregates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Reference key for anonymous aggregates (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub class: TypeClass,
    #[serde(default)]
    pub opaque: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl StructSpec {
    fn key(&self) -> Option<&str> {
        self.key.as_deref().or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Extra scalar names and their sizes, on top of the built-in ones.
    #[serde(default)]
    pub scalars: BTreeMap<String, u64>,
    pub types: Vec<StructSpec>,
}

/// Size of a built-in scalar name; any name ending in `*` is a pointer.
#[must_use]
pub fn builtin_scalar_size(name: &str) -> Option<u64> {
    if name.ends_with('*') {
        return Some(8);
    }
    match name {
        "i1" | "i8" | "u8" | "bool" | "char" => Some(1),
        "i16" | "u16" | "half" => Some(2),
        "i32" | "u32" | "float" | "f32" => Some(4),
        "i64" | "u64" | "double" | "f64" | "ptr" | "usize" | "isize" => Some(8),
        "i128" | "u128" | "fp128" | "x86_fp80" => Some(16),
        _ => None,
    }
}

/// A manifest loaded into a type table.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub table: TypeTable,
    by_key: HashMap<String, TypeId>,
    /// Struct keys in manifest order.
    order: Vec<String>,
}

impl LoadedManifest {
    /// Id of the struct or scalar with this key.
    #[must_use]
    pub fn type_id(&self, key: &str) -> Option<TypeId> {
        self.by_key.get(key).copied()
    }

    /// Structs in the order they were listed.
    pub fn structs(&self) -> impl Iterator<Item = (&str, TypeId)> {
        self.order
            .iter()
            .filter_map(|k| self.by_key.get(k).map(|&id| (k.as_str(), id)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    InProgress,
    Done(TypeId),
}

struct Loader<'m> {
    manifest: &'m Manifest,
    table: TypeTable,
    spec_index: HashMap<&'m str, usize>,
    visits: Vec<Visit>,
    scalars: HashMap<String, TypeId>,
    arrays: HashMap<(TypeId, u64), TypeId>,
}

impl<'m> Loader<'m> {
    fn layout_err(name: &str, source: LayoutError) -> ManifestError {
        ManifestError::Layout {
            name: name.to_string(),
            source,
        }
    }

    fn scalar(&mut self, name: &str) -> Result<Option<TypeId>, ManifestError> {
        if let Some(id) = self.scalars.get(name) {
            return Ok(Some(*id));
        }
        let size = self
            .manifest
            .scalars
            .get(name)
            .copied()
            .or_else(|| builtin_scalar_size(name));
        let Some(size) = size else {
            return Ok(None);
        };
        let id = self
            .table
            .add_scalar(name, size)
            .map_err(|e| Self::layout_err(name, e))?;
        self.scalars.insert(name.to_string(), id);
        Ok(Some(id))
    }

    fn resolve(&mut self, owner: &str, ty: &TypeRef) -> Result<TypeId, ManifestError> {
        match ty {
            TypeRef::Named(name) => {
                if let Some(&index) = self.spec_index.get(name.as_str()) {
                    return self.define(index);
                }
                self.scalar(name)?
                    .ok_or_else(|| ManifestError::UnknownType(name.clone()))
            }
            TypeRef::Array { array, count } => {
                let element = self.resolve(owner, array)?;
                if let Some(id) = self.arrays.get(&(element, *count)) {
                    return Ok(*id);
                }
                let id = self
                    .table
                    .add_array(element, *count)
                    .map_err(|e| Self::layout_err(owner, e))?;
                self.arrays.insert((element, *count), id);
                Ok(id)
            }
        }
    }

    fn define(&mut self, index: usize) -> Result<TypeId, ManifestError> {
        let manifest = self.manifest;
        let spec = &manifest.types[index];
        let key = spec.key().unwrap_or_default();
        match self.visits[index] {
            Visit::Done(id) => return Ok(id),
            Visit::InProgress => return Err(ManifestError::Cycle(key.to_string())),
            Visit::Pending => {}
        }
        self.visits[index] = Visit::InProgress;

        let id = if spec.opaque {
            let name = spec
                .name
                .as_deref()
                .ok_or(ManifestError::UnnamedOpaque { index })?;
            self.table
                .add_opaque(name, spec.class)
                .map_err(|e| Self::layout_err(key, e))?
        } else {
            let mut fields = Vec::with_capacity(spec.fields.len());
            for field in &spec.fields {
                let ty = self.resolve(key, &field.ty)?;
                fields.push(Field::new(field.offset, ty));
            }
            self.table
                .add_struct(spec.name.as_deref(), spec.class, spec.size, fields)
                .map_err(|e| Self::layout_err(key, e))?
        };

        self.visits[index] = Visit::Done(id);
        Ok(id)
    }
}

impl Manifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build the type table described by this manifest.
    pub fn load(&self) -> Result<LoadedManifest, ManifestError> {
        let mut spec_index = HashMap::new();
        let mut order = Vec::with_capacity(self.types.len());
        for (index, spec) in self.types.iter().enumerate() {
            let key = spec.key().ok_or(ManifestError::MissingKey { index })?;
            if spec_index.insert(key, index).is_some() {
                return Err(ManifestError::DuplicateType(key.to_string()));
            }
            order.push(key.to_string());
        }

        let mut loader = Loader {
            manifest: self,
            table: TypeTable::new(),
            spec_index,
            visits: vec![Visit::Pending; self.types.len()],
            scalars: HashMap::new(),
            arrays: HashMap::new(),
        };
        let mut by_key = HashMap::new();
        for (index, key) in order.iter().enumerate() {
            let id = loader.define(index)?;
            by_key.insert(key.clone(), id);
        }
        by_key.extend(loader.scalars);

        Ok(LoadedManifest {
            table: loader.table,
            by_key,
            order,
        })
    }
}

/// Parse and load a manifest in one step.
pub fn load_str(text: &str) -> Result<LoadedManifest, ManifestError> {
    Manifest::from_json(text)?.load()
}
