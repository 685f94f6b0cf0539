//! Descriptor resolution over raw slot addresses.
//!
//! Shadow slots hold bare descriptor addresses. [`DescriptorRef`] is the
//! proof that such an address points at live descriptor words, and runs the
//! shared walk from `castguard-core` directly over that memory.

use castguard_core::descriptor::{AllocationDescriptor, Descriptor, DescriptorForm};
use castguard_core::walk::{self, DescriptorSource, WalkOutcome};

/// Address stored in a slot: the stride word (modulo form) or the root
/// entry (single form) of a descriptor that outlives the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef(usize);

impl DescriptorRef {
    #[must_use]
    pub fn new(descriptor: &'static Descriptor, form: DescriptorForm) -> Self {
        Self(descriptor.slot_address(form))
    }

    #[must_use]
    pub fn from_allocation(allocation: &AllocationDescriptor) -> Self {
        Self::new(allocation.descriptor, allocation.form)
    }

    /// Wrap an address produced elsewhere (instrumented code, a slot).
    ///
    /// # Safety
    ///
    /// `address` must point into a well-formed, terminated descriptor that
    /// stays mapped for the rest of the process, at its stride word or root
    /// entry; every array entry it reaches must name such a descriptor too.
    #[must_use]
    pub const unsafe fn from_raw(address: usize) -> Self {
        Self(address)
    }

    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }

    /// Subobject type at `offset` bytes into the allocation.
    #[must_use]
    pub fn resolve(self, offset: u64) -> WalkOutcome {
        walk::walk(&RawWords, self.0 as *const u64, offset)
    }
}

struct RawWords;

impl DescriptorSource for RawWords {
    type Cursor = *const u64;

    fn read(&self, at: *const u64) -> u64 {
        // SAFETY: cursors start at a `DescriptorRef` address and the walk
        // never steps past a terminator, so `at` is inside the descriptor.
        unsafe { at.read() }
    }

    fn step(&self, at: *const u64, words: usize) -> *const u64 {
        at.wrapping_add(words)
    }

    fn element(&self, _from: *const u64, address: u64) -> Option<*const u64> {
        (address != 0).then_some(address as *const u64)
    }
}
