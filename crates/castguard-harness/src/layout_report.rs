//! Descriptor and registration dumps for layout manifests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use castguard_core::descriptor::{DescriptorEntry, DescriptorShape};
use castguard_core::{
    DescriptorBuilder, Hierarchy, LoadedManifest, ManifestError, RegistrationTable, TypeHash,
    canonical_name, manifest,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
}

/// Read and load a manifest file.
pub fn load_manifest_file(path: &Path) -> Result<LoadedManifest, HarnessError> {
    let text = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    manifest::load_str(&text).map_err(|source| HarnessError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

/// Canonical form and hash of one type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashReport {
    pub name: String,
    pub canonical: String,
    pub hash: String,
}

#[must_use]
pub fn hash_names<S: AsRef<str>>(names: &[S]) -> Vec<HashReport> {
    names
        .iter()
        .map(|name| {
            let canonical = canonical_name(name.as_ref());
            let hash = TypeHash::of_canonical(&canonical).to_string();
            HashReport {
                name: name.as_ref().to_string(),
                canonical,
                hash,
            }
        })
        .collect()
}

/// One descriptor entry in readable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryReport {
    Field { offset: u64, hash: String },
    /// Array members name their element descriptor instead of its address.
    Array { offset: u64, element: String },
    Gap { offset: u64 },
    Untracked,
    Terminator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub shape: &'static str,
    pub stride: u64,
    pub entries: Vec<EntryReport>,
    /// Encoded words as hex. Array payloads are process addresses.
    pub words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationReport {
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub merge: bool,
    pub ancestors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub types: Vec<TypeReport>,
    pub registration: Vec<RegistrationReport>,
    pub registration_words: Vec<String>,
}

fn hex_words(words: &[u64]) -> Vec<String> {
    words.iter().map(|w| format!("{w:#x}")).collect()
}

impl LayoutReport {
    /// Build descriptors for every struct in `loaded`, in manifest order.
    #[must_use]
    pub fn build(loaded: &LoadedManifest) -> Self {
        let mut builder = DescriptorBuilder::new(&loaded.table);
        let mut types = Vec::new();
        for (name, ty) in loaded.structs() {
            let Some(descriptor) = builder.descriptor(ty) else {
                continue;
            };
            let (shape, hash) = match descriptor.shape() {
                DescriptorShape::Tracked(hash) => ("tracked", Some(hash.to_string())),
                DescriptorShape::Excluded => ("excluded", None),
                DescriptorShape::Untracked => ("untracked", None),
            };
            let entries = descriptor
                .entries()
                .into_iter()
                .map(|entry| match entry {
                    DescriptorEntry::Field { offset, hash } => EntryReport::Field {
                        offset,
                        hash: hash.to_string(),
                    },
                    DescriptorEntry::Array { offset, element } => EntryReport::Array {
                        offset,
                        element: builder
                            .find_by_address(element)
                            .map_or_else(|| format!("{element:#x}"), |d| d.name().to_string()),
                    },
                    DescriptorEntry::Gap { offset } => EntryReport::Gap { offset },
                    DescriptorEntry::Untracked => EntryReport::Untracked,
                    DescriptorEntry::Terminator => EntryReport::Terminator,
                })
                .collect();
            types.push(TypeReport {
                name: name.to_string(),
                hash,
                shape,
                stride: descriptor.stride(),
                entries,
                words: hex_words(descriptor.words()),
            });
        }

        let hierarchy = Hierarchy::analyze(&loaded.table);
        let names: HashMap<TypeHash, &str> = hierarchy
            .classes()
            .map(|class| (class.hash, class.name.as_str()))
            .collect();
        let entries = hierarchy.registration_entries();
        let registration = entries
            .iter()
            .map(|entry| RegistrationReport {
                class: entry.class.to_string(),
                name: names.get(&entry.class).map(|n| (*n).to_string()),
                merge: entry.merge,
                ancestors: entry.ancestors.iter().map(ToString::to_string).collect(),
            })
            .collect();
        let table = RegistrationTable::new(entries);

        Self {
            types,
            registration,
            registration_words: hex_words(&table.encode()),
        }
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.name == name)
    }
}
