//! Canonical type names and 64-bit type hashes.
//!
//! A type is identified across translation units by the CRC-64 of its
//! canonical name (reflected ECMA-182 polynomial, all-ones seed, final
//! complement). The instrumentation stage and the runtime must compute the
//! same value for the same type, so canonicalization is purely textual:
//! pointer and quote decorations are dropped, and the compiler-injected
//! `.base` suffix of base-subobject layouts is stripped so they hash like
//! the class they belong to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reflected form of the ECMA-182 polynomial.
const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;

/// Suffix the compiler appends to base-subobject layouts.
pub const BASE_SUFFIX: &str = ".base";

/// Name hashed for aggregates that have no name of their own.
pub const ANONYMOUS_TYPE_NAME: &str = "anon._";

static CRC64_TABLE: [u64; 256] = build_crc64_table();

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut crc = byte as u64;
        let mut bit = 0;
        while bit < 8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (CRC64_POLY & mask);
            bit += 1;
        }
        table[byte] = crc;
        byte += 1;
    }
    table
}

/// CRC-64 over `bytes`.
#[must_use]
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut crc = u64::MAX;
    for &b in bytes {
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ u64::from(b)) & 0xFF) as usize];
    }
    !crc
}

/// Strip pointer/quote decorations and the first `.base` suffix.
#[must_use]
pub fn canonical_name(raw: &str) -> String {
    let mut name: String = raw.chars().filter(|c| *c != '*' && *c != '\'').collect();
    if let Some(pos) = name.find(BASE_SUFFIX) {
        name.replace_range(pos..pos + BASE_SUFFIX.len(), "");
    }
    name
}

/// Stable 64-bit identity of a composite type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeHash(pub u64);

impl TypeHash {
    /// Reserved value meaning "no type information" inside descriptors.
    pub const NO_INFO: Self = Self(u64::MAX);

    /// Hash a raw (not yet canonical) type name.
    #[must_use]
    pub fn of_name(raw: &str) -> Self {
        Self::of_canonical(&canonical_name(raw))
    }

    /// Hash a name that is already canonical.
    #[must_use]
    pub fn of_canonical(name: &str) -> Self {
        Self(crc64(name.as_bytes()))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_no_info(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for TypeHash {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc64_matches_xz_check_value() {
        assert_eq!(crc64(b"123456789"), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn crc64_of_empty_input_is_zero() {
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn canonical_name_strips_decorations() {
        assert_eq!(canonical_name("class.Foo*"), "class.Foo");
        assert_eq!(canonical_name("class.'Foo'**"), "class.Foo");
        assert_eq!(canonical_name("class.Foo.base"), "class.Foo");
        assert_eq!(canonical_name("class.Foo"), "class.Foo");
    }

    #[test]
    fn base_subobject_hashes_like_its_class() {
        assert_eq!(
            TypeHash::of_name("class.Widget.base"),
            TypeHash::of_name("class.Widget")
        );
        assert_ne!(
            TypeHash::of_name("class.Widget"),
            TypeHash::of_name("class.Gadget")
        );
    }

    #[test]
    fn only_first_base_suffix_is_removed() {
        assert_eq!(canonical_name("a.base.base"), "a.base");
    }

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(TypeHash(0x1).to_string(), "0x0000000000000001");
        assert!(TypeHash::NO_INFO.is_no_info());
    }
}
