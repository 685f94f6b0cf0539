//! Metadata write path.
//!
//! Installs `(base, descriptor)` into every slot covering a new allocation.
//! The whole range is validated against the page table before the first
//! slot is written, so a failed record leaves no partial metadata behind.

use thiserror::Error;

use crate::metrics::CastMetrics;
use crate::resolve::DescriptorRef;
use crate::shadow::{ShadowTable, fill_slots};

/// Statically shaped records with at most this many slots count as inline.
pub const INLINE_SLOT_LIMIT: usize = 16;

/// Where an allocation lives. Decoded from the low byte of the ABI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationKind {
    #[default]
    Unknown,
    Stack,
    Heap,
    Global,
}

impl AllocationKind {
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Stack,
            2 => Self::Heap,
            3 => Self::Global,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Stack => 1,
            Self::Heap => 2,
            Self::Global => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stack => "stack",
            Self::Heap => "heap",
            Self::Global => "global",
        }
    }
}

/// One allocation to record.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub ptr: usize,
    pub descriptor: DescriptorRef,
    /// Granule size the caller assumed, when known statically.
    pub alignment_bits: Option<u8>,
    /// Element count, when known statically.
    pub element_count: Option<u64>,
    pub byte_size: usize,
    pub kind: AllocationKind,
    /// Element type has no stable name; slots get a null base.
    pub anonymous: bool,
    pub label: Option<String>,
}

impl AllocationRecord {
    #[must_use]
    pub fn new(ptr: usize, descriptor: DescriptorRef, byte_size: usize) -> Self {
        Self {
            ptr,
            descriptor,
            alignment_bits: None,
            element_count: None,
            byte_size,
            kind: AllocationKind::Unknown,
            anonymous: false,
            label: None,
        }
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment_bits: u8) -> Self {
        self.alignment_bits = Some(alignment_bits);
        self
    }

    #[must_use]
    pub fn with_element_count(mut self, count: u64) -> Self {
        self.element_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: AllocationKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Base stored in the slots.
    #[must_use]
    pub const fn stored_base(&self) -> usize {
        if self.anonymous { 0 } else { self.ptr }
    }

    /// Classification of this record's write. The slot estimate assumes byte
    /// granules when the alignment is not known statically.
    #[must_use]
    pub fn plan(&self) -> WritePlan {
        let granule = 1usize
            .checked_shl(u32::from(self.alignment_bits.unwrap_or(0)))
            .unwrap_or(usize::MAX);
        let slots = self.byte_size.div_ceil(granule);
        let static_shape = self.alignment_bits.is_some() && self.element_count.is_some();
        if static_shape && slots <= INLINE_SLOT_LIMIT {
            WritePlan::Inline { slots }
        } else {
            WritePlan::Bulk { slots }
        }
    }
}

/// How a record's write is counted.
///
/// Both variants store the same slots the same way; the split only feeds the
/// `inline_writes` and `bulk_writes` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Small record whose alignment and element count were known statically.
    Inline { slots: usize },
    /// Dynamically shaped or large record.
    Bulk { slots: usize },
}

impl WritePlan {
    #[must_use]
    pub const fn slots(self) -> usize {
        match self {
            Self::Inline { slots } | Self::Bulk { slots } => slots,
        }
    }

    const fn with_slots(self, slots: usize) -> Self {
        match self {
            Self::Inline { .. } => Self::Inline { slots },
            Self::Bulk { .. } => Self::Bulk { slots },
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("no shadow metadata for {addr:#x}")]
    UntrackedRange { addr: usize },
    #[error("page at {addr:#x} uses 2^{expected} granules, caller assumed 2^{requested}")]
    AlignmentMismatch {
        addr: usize,
        expected: u8,
        requested: u8,
    },
}

/// Write `record` into `shadow`.
///
/// Returns the plan used with the number of slots actually written.
pub fn record_allocation(
    shadow: &ShadowTable,
    metrics: &CastMetrics,
    record: &AllocationRecord,
) -> Result<WritePlan, RecordError> {
    let counter = match record.kind {
        AllocationKind::Stack => &metrics.allocations_stack,
        AllocationKind::Heap => &metrics.allocations_heap,
        AllocationKind::Global => &metrics.allocations_global,
        AllocationKind::Unknown => &metrics.allocations_other,
    };
    CastMetrics::inc(counter);

    let plan = record.plan();
    if record.byte_size == 0 {
        return Ok(plan.with_slots(0));
    }

    if let Err(err) = validate_range(shadow, record) {
        match err {
            RecordError::UntrackedRange { .. } => {
                CastMetrics::inc(&metrics.untracked_range_records);
            }
            RecordError::AlignmentMismatch { .. } => {
                CastMetrics::inc(&metrics.alignment_mismatches);
            }
        }
        return Err(err);
    }

    let base = record.stored_base();
    let end = record.ptr + record.byte_size;
    let page_size = shadow.geometry().page_size();
    let mut addr = record.ptr;
    let mut written = 0usize;
    while addr < end {
        let page_end = shadow.geometry().page_start(addr) + page_size;
        let Some(slots) = shadow.page_slots(addr, end - addr) else {
            return Err(RecordError::UntrackedRange { addr });
        };
        fill_slots(slots, base, record.descriptor);
        written += slots.len();
        addr = page_end;
    }

    match plan {
        WritePlan::Inline { .. } => CastMetrics::inc(&metrics.inline_writes),
        WritePlan::Bulk { .. } => CastMetrics::inc(&metrics.bulk_writes),
    }
    CastMetrics::add(&metrics.slots_written, written as u64);
    Ok(plan.with_slots(written))
}

fn validate_range(shadow: &ShadowTable, record: &AllocationRecord) -> Result<(), RecordError> {
    let geometry = shadow.geometry();
    let end = record
        .ptr
        .checked_add(record.byte_size)
        .ok_or(RecordError::UntrackedRange { addr: record.ptr })?;
    let mut addr = record.ptr;
    while addr < end {
        let mapping = shadow
            .lookup(addr)
            .ok_or(RecordError::UntrackedRange { addr })?;
        if let Some(requested) = record.alignment_bits {
            if requested != mapping.alignment_bits {
                return Err(RecordError::AlignmentMismatch {
                    addr,
                    expected: mapping.alignment_bits,
                    requested,
                });
            }
        }
        addr = geometry.page_start(addr) + geometry.page_size();
    }
    Ok(())
}
