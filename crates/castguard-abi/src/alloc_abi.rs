//! Allocation recording and range tracking.

use std::ffi::{c_char, c_int};

use castguard_membrane::globals::track_loaded_segments;
use castguard_membrane::shadow::{MetadataSlot, fill_slots_raw};
use castguard_membrane::{AllocationKind, AllocationRecord, DescriptorRef, RecordError};

use crate::util::read_label;

/// Record or track call succeeded.
pub const CG_OK: c_int = 0;
/// No runtime is available.
pub const CG_ERR_NO_RUNTIME: c_int = -1;
/// Invalid argument (null descriptor, oversized alignment).
pub const CG_ERR_INVALID: c_int = -2;
/// The range has no shadow metadata.
pub const CG_ERR_UNTRACKED: c_int = 1;
/// The caller's granule disagrees with the page entry.
pub const CG_ERR_ALIGNMENT: c_int = 2;
/// Metadata for the range could not be allocated or bound.
pub const CG_ERR_MAP: c_int = 3;

/// `flags` bit marking an anonymous type.
pub const CG_FLAG_ANONYMOUS: u32 = 1 << 8;

fn record_error_code(err: RecordError) -> c_int {
    match err {
        RecordError::UntrackedRange { .. } => CG_ERR_UNTRACKED,
        RecordError::AlignmentMismatch { .. } => CG_ERR_ALIGNMENT,
    }
}

abi_fn! {
    /// Record a new allocation at `ptr`.
    ///
    /// `descriptor` is the slot address of an emitted descriptor (single or
    /// modulo form). `alignment_bits == 0` and `element_count == 0` mean
    /// unknown. The low byte of `flags` is the allocation kind.
    fn castguard_record_allocation(
        ptr: usize,
        descriptor: *const u64,
        alignment_bits: u32,
        element_count: u64,
        byte_size: u64,
        flags: u32,
        label: *const c_char,
    ) -> c_int,
    runtime(rt) else CG_ERR_NO_RUNTIME;
    {
        if descriptor.is_null() {
            return CG_ERR_INVALID;
        }
        let Ok(alignment_bits) = u8::try_from(alignment_bits) else {
            return CG_ERR_INVALID;
        };
        // SAFETY: instrumentation passes the address of an immortal,
        // terminated descriptor.
        let descriptor = DescriptorRef::from_raw(descriptor as usize);
        let mut record = AllocationRecord::new(ptr, descriptor, byte_size as usize)
            .with_kind(AllocationKind::from_code((flags & 0xff) as u8));
        if alignment_bits != 0 {
            record = record.with_alignment(alignment_bits);
        }
        if element_count != 0 {
            record = record.with_element_count(element_count);
        }
        if flags & CG_FLAG_ANONYMOUS != 0 {
            record = record.anonymous();
        }
        if let Some(label) = read_label(label) {
            record = record.with_label(label);
        }
        match rt.record_allocation(&record) {
            Ok(_) => CG_OK,
            Err(err) => record_error_code(err),
        }
    }
}

abi_fn! {
    /// Fill `count` metadata slots starting at `meta` with one record.
    fn castguard_fill_slots(meta: *mut MetadataSlot, count: usize, base: usize, descriptor: usize) {
        // SAFETY: `meta` comes from a page entry lookup done by the caller.
        fill_slots_raw(meta, count, base, descriptor);
    }
}

abi_fn! {
    /// Allocate and bind metadata for `[base, base + size)`.
    fn castguard_track_range(base: usize, size: usize, alignment_bits: u32) -> c_int,
    runtime(rt) else CG_ERR_NO_RUNTIME;
    {
        let Ok(alignment_bits) = u8::try_from(alignment_bits) else {
            return CG_ERR_INVALID;
        };
        match rt.track_range(base, size, alignment_bits) {
            Ok(_) => CG_OK,
            Err(_) => CG_ERR_MAP,
        }
    }
}

abi_fn! {
    /// Track every loaded ELF segment. Returns the number newly tracked.
    fn castguard_track_loaded_segments() -> c_int,
    runtime(rt) else CG_ERR_NO_RUNTIME;
    {
        let summary = track_loaded_segments(rt.shadow(), rt.metrics());
        c_int::try_from(summary.tracked).unwrap_or(c_int::MAX)
    }
}
