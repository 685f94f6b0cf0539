//! # castguard-core
//!
//! Build-side half of the castguard type-confusion detector.
//!
//! Everything in this crate is pure data manipulation and contains no `unsafe`
//! code. The runtime (`castguard-membrane`) consumes what is produced here:
//!
//! - **Type model** (`layout`): arena of scalar, struct and array types.
//! - **Layout manifests** (`manifest`): JSON description of a type table.
//! - **Type hashes** (`hash`): canonical names and their CRC-64 identity.
//! - **Descriptor builder** (`descriptor`): flattens composite layouts into
//!   interned offset tables with the exact word encoding the runtime walks.
//! - **Hierarchy analysis** (`hierarchy`): first-member base discovery and
//!   phantom (empty-derived) ancestor propagation.
//! - **Registration tables** (`registration`): the per-module wire format
//!   merged into the runtime class hash registry.
//! - **Offset walk** (`walk`): resolves the subobject type at an offset,
//!   shared by tooling and the runtime hot path.

#![deny(unsafe_code)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("castguard descriptors embed addresses in 64-bit words");

pub mod descriptor;
pub mod hash;
pub mod hierarchy;
pub mod layout;
pub mod manifest;
pub mod registration;
pub mod walk;

pub use descriptor::{
    AllocationDescriptor, Descriptor, DescriptorBuilder, DescriptorEntry, DescriptorForm,
    DescriptorShape,
};
pub use hash::{TypeHash, canonical_name};
pub use manifest::{LoadedManifest, Manifest, ManifestError};
pub use hierarchy::Hierarchy;
pub use layout::{Field, LayoutError, TypeClass, TypeId, TypeKind, TypeTable};
pub use registration::{RegistrationEntry, RegistrationError, RegistrationTable};
pub use walk::{DescriptorSource, WalkOutcome};
