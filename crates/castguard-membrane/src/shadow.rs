//! Sparse page-indexed shadow table.
//!
//! One `u64` entry per page of the tracked address space. A nonzero entry is
//! `(metadata_base << 8) | alignment_bits`: the page's metadata slots start
//! at `metadata_base`, one 16-byte [`MetadataSlot`] per `2^alignment_bits`
//! bytes. The table itself is a `MAP_NORESERVE` anonymous mapping, so only
//! pages of it that get written are ever backed.
//!
//! Metadata regions are allocated here too and remembered so that binding
//! can check ownership and size, and so that dropping the table unmaps them.

use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::resolve::DescriptorRef;

/// Placement hint for the process-wide table.
pub const DEFAULT_TABLE_HINT: usize = 0x4000_0000_0000;

/// Bytes per metadata slot: allocation base plus descriptor address.
pub const SLOT_BYTES: usize = 16;

const ALIGNMENT_MASK: u64 = 0xFF;

/// Address-space shape covered by a [`ShadowTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowGeometry {
    pub address_bits: u8,
    pub page_shift: u8,
}

impl ShadowGeometry {
    /// 48-bit user address space, 4 KiB pages.
    pub const DEFAULT: Self = Self {
        address_bits: 48,
        page_shift: 12,
    };

    #[must_use]
    pub const fn new(address_bits: u8, page_shift: u8) -> Self {
        Self {
            address_bits,
            page_shift,
        }
    }

    #[must_use]
    pub const fn page_size(self) -> usize {
        1 << self.page_shift
    }

    #[must_use]
    pub const fn page_count(self) -> usize {
        1 << (self.address_bits - self.page_shift)
    }

    #[must_use]
    pub const fn table_bytes(self) -> usize {
        self.page_count() * size_of::<u64>()
    }

    /// Page index of `addr`, if the address is inside the covered space.
    #[must_use]
    pub const fn page_index(self, addr: usize) -> Option<usize> {
        let index = addr >> self.page_shift;
        if index < self.page_count() {
            Some(index)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn page_start(self, addr: usize) -> usize {
        addr & !(self.page_size() - 1)
    }

    /// Slots needed per page at the given alignment.
    #[must_use]
    pub const fn slots_per_page(self, alignment_bits: u8) -> usize {
        self.page_size() >> alignment_bits
    }

    const fn is_valid(self) -> bool {
        self.page_shift >= 3
            && self.page_shift < self.address_bits
            && self.address_bits <= 56
            && (self.address_bits - self.page_shift) < 40
    }
}

impl Default for ShadowGeometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("invalid shadow geometry: {address_bits}-bit space with 2^{page_shift} pages")]
    InvalidGeometry { address_bits: u8, page_shift: u8 },
    #[error("alignment 2^{alignment_bits} exceeds the 2^{page_shift} page size")]
    InvalidAlignment { alignment_bits: u8, page_shift: u8 },
    #[error("range {base:#x}+{size:#x} lies outside the shadow address space")]
    OutOfRange { base: usize, size: usize },
    #[error("metadata region {base:#x} is not owned by this table")]
    UnknownRegion { base: usize },
    #[error("metadata region holds {available} bytes, range needs {needed}")]
    RegionTooSmall { needed: usize, available: usize },
    #[error("mapping {len:#x} bytes failed")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// One granule's metadata.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MetadataSlot {
    base: AtomicUsize,
    descriptor: AtomicUsize,
}

/// Loaded contents of a [`MetadataSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotValue {
    /// Allocation base; 0 when no record covers the slot.
    pub base: usize,
    pub descriptor: Option<DescriptorRef>,
}

impl MetadataSlot {
    pub fn store(&self, base: usize, descriptor: DescriptorRef) {
        self.base.store(base, Ordering::Relaxed);
        self.descriptor.store(descriptor.address(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn load(&self) -> SlotValue {
        let base = self.base.load(Ordering::Relaxed);
        let raw = self.descriptor.load(Ordering::Relaxed);
        // SAFETY: descriptor words are only written through `store`, which
        // takes a `DescriptorRef`, or `fill_slots_raw`, whose caller vouches
        // for the address. Descriptors live for the rest of the process.
        let descriptor = (raw != 0).then(|| unsafe { DescriptorRef::from_raw(raw) });
        SlotValue { base, descriptor }
    }
}

/// Store `(base, descriptor)` into every slot.
pub fn fill_slots(slots: &[MetadataSlot], base: usize, descriptor: DescriptorRef) {
    for slot in slots {
        slot.store(base, descriptor);
    }
}

/// Raw form of [`fill_slots`] for the C boundary.
///
/// # Safety
///
/// `metadata` must point at `count` writable slots inside a live metadata
/// region, and `descriptor` must be zero or a valid descriptor slot address
/// (see [`DescriptorRef::from_raw`]).
pub unsafe fn fill_slots_raw(
    metadata: *mut MetadataSlot,
    count: usize,
    base: usize,
    descriptor: usize,
) {
    if metadata.is_null() || count == 0 {
        return;
    }
    // SAFETY: the caller guarantees `count` slots at `metadata`.
    let slots = unsafe { std::slice::from_raw_parts(metadata, count) };
    for slot in slots {
        slot.base.store(base, Ordering::Relaxed);
        slot.descriptor.store(descriptor, Ordering::Relaxed);
    }
}

/// A reserved run of metadata slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRegion {
    pub base: usize,
    pub len: usize,
    pub alignment_bits: u8,
}

impl MetadataRegion {
    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.len / SLOT_BYTES
    }
}

/// Decoded page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    /// First slot of the page.
    pub metadata: usize,
    pub alignment_bits: u8,
}

impl PageMapping {
    const fn decode(entry: u64) -> Option<Self> {
        if entry == 0 {
            return None;
        }
        Some(Self {
            metadata: (entry >> 8) as usize,
            alignment_bits: (entry & ALIGNMENT_MASK) as u8,
        })
    }

    const fn encode(self) -> u64 {
        ((self.metadata as u64) << 8) | self.alignment_bits as u64
    }
}

fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).ok().filter(|p| p.is_power_of_two()).unwrap_or(4096)
}

fn map_anonymous(len: usize, hint: Option<usize>) -> Result<NonNull<u8>, ShadowError> {
    let addr = hint.unwrap_or(0) as *mut libc::c_void;
    // SAFETY: anonymous private mapping without MAP_FIXED never replaces
    // existing mappings; the hint is advisory.
    let ptr = unsafe {
        libc::mmap(
            addr,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShadowError::Map {
            len,
            source: io::Error::last_os_error(),
        });
    }
    NonNull::new(ptr.cast::<u8>()).ok_or(ShadowError::Map {
        len,
        source: io::Error::from(io::ErrorKind::AddrNotAvailable),
    })
}

fn unmap(base: usize, len: usize) {
    // SAFETY: callers pass mappings created by `map_anonymous`.
    unsafe {
        libc::munmap(base as *mut libc::c_void, len);
    }
}

/// Page table plus the metadata regions it points into.
pub struct ShadowTable {
    geometry: ShadowGeometry,
    entries: NonNull<AtomicU64>,
    system_page: usize,
    regions: Mutex<HashMap<usize, MetadataRegion>>,
}

// SAFETY: the entry array and the slots it points to are only accessed
// through atomics; the region map is behind a mutex.
unsafe impl Send for ShadowTable {}
// SAFETY: see above.
unsafe impl Sync for ShadowTable {}

impl ShadowTable {
    /// Reserve a table wherever the kernel places it.
    pub fn reserve(geometry: ShadowGeometry) -> Result<Self, ShadowError> {
        Self::reserve_at(geometry, None)
    }

    /// Reserve a table, preferring `hint` when that range is free.
    pub fn reserve_at(geometry: ShadowGeometry, hint: Option<usize>) -> Result<Self, ShadowError> {
        if !geometry.is_valid() {
            return Err(ShadowError::InvalidGeometry {
                address_bits: geometry.address_bits,
                page_shift: geometry.page_shift,
            });
        }
        let entries = map_anonymous(geometry.table_bytes(), hint)?;
        Ok(Self {
            geometry,
            entries: entries.cast::<AtomicU64>(),
            system_page: system_page_size(),
            regions: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn geometry(&self) -> ShadowGeometry {
        self.geometry
    }

    /// Address of the page table itself.
    #[must_use]
    pub fn table_address(&self) -> usize {
        self.entries.as_ptr() as usize
    }

    fn entry(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.geometry.page_count());
        // SAFETY: `index` comes from `page_index`, so it is inside the
        // zero-initialized mapping, and zero is a valid `AtomicU64`.
        unsafe { &*self.entries.as_ptr().add(index) }
    }

    fn check_alignment(&self, alignment_bits: u8) -> Result<(), ShadowError> {
        if alignment_bits > self.geometry.page_shift {
            return Err(ShadowError::InvalidAlignment {
                alignment_bits,
                page_shift: self.geometry.page_shift,
            });
        }
        Ok(())
    }

    /// Page-aligned `[start, end)` covering `base..base+size`.
    fn page_span(&self, base: usize, size: usize) -> Result<(usize, usize), ShadowError> {
        let out_of_range = ShadowError::OutOfRange { base, size };
        let last = base
            .checked_add(size.max(1) - 1)
            .ok_or(ShadowError::OutOfRange { base, size })?;
        let first_page = self.geometry.page_index(base).ok_or(out_of_range)?;
        let last_page = self
            .geometry
            .page_index(last)
            .ok_or(ShadowError::OutOfRange { base, size })?;
        Ok((first_page, last_page + 1))
    }

    /// Reserve slots for `size` bytes at `2^alignment_bits` granularity.
    pub fn allocate_metadata(
        &self,
        size: usize,
        alignment_bits: u8,
    ) -> Result<MetadataRegion, ShadowError> {
        self.check_alignment(alignment_bits)?;
        let slots = (size >> alignment_bits).max(1);
        let bytes = slots
            .checked_mul(SLOT_BYTES)
            .and_then(|b| b.checked_next_multiple_of(self.system_page))
            .ok_or(ShadowError::OutOfRange { base: 0, size })?;
        let base = map_anonymous(bytes, None)?.as_ptr() as usize;
        let region = MetadataRegion {
            base,
            len: bytes,
            alignment_bits,
        };
        self.regions.lock().insert(base, region);
        Ok(region)
    }

    /// Point every page of `base..base+size` at consecutive runs of `region`.
    pub fn bind_range(
        &self,
        base: usize,
        size: usize,
        region: &MetadataRegion,
    ) -> Result<(), ShadowError> {
        self.check_alignment(region.alignment_bits)?;
        if self.regions.lock().get(&region.base) != Some(region) {
            return Err(ShadowError::UnknownRegion { base: region.base });
        }
        let (first, end) = self.page_span(base, size)?;
        let per_page = self.geometry.slots_per_page(region.alignment_bits) * SLOT_BYTES;
        let needed = (end - first) * per_page;
        if needed > region.len {
            return Err(ShadowError::RegionTooSmall {
                needed,
                available: region.len,
            });
        }
        for (i, index) in (first..end).enumerate() {
            let mapping = PageMapping {
                metadata: region.base + i * per_page,
                alignment_bits: region.alignment_bits,
            };
            self.entry(index).store(mapping.encode(), Ordering::Release);
        }
        Ok(())
    }

    /// Allocate and bind metadata for `base..base+size`.
    pub fn track_range(
        &self,
        base: usize,
        size: usize,
        alignment_bits: u8,
    ) -> Result<MetadataRegion, ShadowError> {
        self.check_alignment(alignment_bits)?;
        let (first, end) = self.page_span(base, size)?;
        let span = (end - first) << self.geometry.page_shift;
        let region = self.allocate_metadata(span, alignment_bits)?;
        self.bind_range(base, size, &region)?;
        Ok(region)
    }

    /// Clear the entries for every page of `base..base+size`.
    pub fn unbind_range(&self, base: usize, size: usize) -> Result<(), ShadowError> {
        let (first, end) = self.page_span(base, size)?;
        for index in first..end {
            self.entry(index).store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Unmap a metadata region.
    ///
    /// # Safety
    ///
    /// No page entry may still point into `region`, and no slot reference
    /// obtained from [`Self::slot`] or [`Self::page_slots`] may be alive.
    pub unsafe fn release_metadata(&self, region: &MetadataRegion) -> Result<(), ShadowError> {
        let removed = self.regions.lock().remove(&region.base);
        match removed {
            Some(owned) => {
                unmap(owned.base, owned.len);
                Ok(())
            }
            None => Err(ShadowError::UnknownRegion { base: region.base }),
        }
    }

    /// Mapping for the page holding `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<PageMapping> {
        let index = self.geometry.page_index(addr)?;
        PageMapping::decode(self.entry(index).load(Ordering::Acquire))
    }

    /// Whether the page holding `addr` has metadata.
    #[must_use]
    pub fn is_tracked(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Slot covering `addr`.
    #[must_use]
    pub fn slot(&self, addr: usize) -> Option<&MetadataSlot> {
        self.page_slots(addr, 1).and_then(|slots| slots.first())
    }

    /// Slots covering `addr..addr+len`, clipped to the end of `addr`'s page.
    #[must_use]
    pub fn page_slots(&self, addr: usize, len: usize) -> Option<&[MetadataSlot]> {
        let mapping = self.lookup(addr)?;
        let page = self.geometry.page_start(addr);
        let end = addr
            .saturating_add(len.max(1))
            .min(page + self.geometry.page_size());
        let first = (addr - page) >> mapping.alignment_bits;
        let last = (end - 1 - page) >> mapping.alignment_bits;
        let start = (mapping.metadata + first * SLOT_BYTES) as *const MetadataSlot;
        // SAFETY: a nonzero entry points at `slots_per_page` slots inside a
        // region this table owns, and `first..=last` stays inside the page.
        Some(unsafe { std::slice::from_raw_parts(start, last - first + 1) })
    }

    /// Number of metadata regions currently owned.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl Drop for ShadowTable {
    fn drop(&mut self) {
        for region in self.regions.get_mut().drain().map(|(_, r)| r) {
            unmap(region.base, region.len);
        }
        unmap(self.entries.as_ptr() as usize, self.geometry.table_bytes());
    }
}

impl std::fmt::Debug for ShadowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowTable")
            .field("geometry", &self.geometry)
            .field("table", &format_args!("{:#x}", self.table_address()))
            .field("regions", &self.region_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_GEOMETRY: ShadowGeometry = ShadowGeometry::new(32, 12);

    #[test]
    fn geometry_math() {
        let g = ShadowGeometry::DEFAULT;
        assert_eq!(g.page_size(), 4096);
        assert_eq!(g.page_count(), 1 << 36);
        assert_eq!(g.page_index(0x1000), Some(1));
        assert_eq!(g.page_index(1 << 48), None);
        assert_eq!(g.slots_per_page(3), 512);
        assert_eq!(TEST_GEOMETRY.table_bytes(), 8 << 20);
    }

    #[test]
    fn rejects_bad_geometry() {
        let err = ShadowTable::reserve(ShadowGeometry::new(12, 12)).unwrap_err();
        assert!(matches!(err, ShadowError::InvalidGeometry { .. }));
    }

    #[test]
    fn fresh_table_tracks_nothing() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        assert!(table.lookup(0x1234_5678).is_none());
        assert!(table.slot(0x1234_5678).is_none());
        assert!(table.lookup(u32::MAX as usize + 1).is_none());
    }

    #[test]
    fn bind_writes_consecutive_page_runs() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        let region = table.allocate_metadata(3 * 4096, 3).unwrap();
        table.bind_range(0x10_0000, 3 * 4096, &region).unwrap();
        for page in 0..3 {
            let mapping = table.lookup(0x10_0000 + page * 4096 + 8).unwrap();
            assert_eq!(mapping.alignment_bits, 3);
            assert_eq!(mapping.metadata, region.base + page * 512 * SLOT_BYTES);
        }
        assert!(table.lookup(0x10_0000 + 3 * 4096).is_none());
    }

    #[test]
    fn bind_expands_to_page_boundaries() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        let region = table.track_range(0x20_0ff0, 0x20, 4).unwrap();
        assert!(table.is_tracked(0x20_0000));
        assert!(table.is_tracked(0x20_1fff));
        assert!(!table.is_tracked(0x20_2000));
        assert!(region.slot_count() >= 2 * 256);
    }

    #[test]
    fn undersized_and_foreign_regions_fail() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        let region = table.allocate_metadata(4096, 3).unwrap();
        let err = table.bind_range(0x40_0000, 64 * 4096, &region).unwrap_err();
        assert!(matches!(err, ShadowError::RegionTooSmall { .. }));

        let foreign = MetadataRegion {
            base: 0x1000,
            len: 1 << 20,
            alignment_bits: 3,
        };
        let err = table.bind_range(0x40_0000, 4096, &foreign).unwrap_err();
        assert!(matches!(err, ShadowError::UnknownRegion { base: 0x1000 }));
    }

    #[test]
    fn alignment_beyond_page_is_rejected() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        let err = table.allocate_metadata(4096, 13).unwrap_err();
        assert!(matches!(err, ShadowError::InvalidAlignment { .. }));
    }

    #[test]
    fn slots_map_granules() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        table.track_range(0x30_0000, 4096, 4).unwrap();
        let a = table.slot(0x30_0010).unwrap() as *const MetadataSlot;
        let b = table.slot(0x30_001f).unwrap() as *const MetadataSlot;
        let c = table.slot(0x30_0020).unwrap() as *const MetadataSlot;
        assert_eq!(a, b);
        assert_eq!(c as usize - a as usize, SLOT_BYTES);
        assert_eq!(table.page_slots(0x30_0ff0, 0x100).unwrap().len(), 1);
        assert_eq!(table.page_slots(0x30_0000, 0x40).unwrap().len(), 4);
    }

    #[test]
    fn fresh_slots_are_empty() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        table.track_range(0x50_0000, 4096, 3).unwrap();
        let value = table.slot(0x50_0100).unwrap().load();
        assert_eq!(value.base, 0);
        assert!(value.descriptor.is_none());
    }

    #[test]
    fn unbind_and_release() {
        let table = ShadowTable::reserve(TEST_GEOMETRY).unwrap();
        let region = table.track_range(0x60_0000, 4096, 3).unwrap();
        assert_eq!(table.region_count(), 1);
        table.unbind_range(0x60_0000, 4096).unwrap();
        assert!(!table.is_tracked(0x60_0000));
        // SAFETY: entries were cleared and no slot references are held.
        unsafe { table.release_metadata(&region).unwrap() };
        assert_eq!(table.region_count(), 0);
        // SAFETY: as above.
        let again = unsafe { table.release_metadata(&region) };
        assert!(matches!(again, Err(ShadowError::UnknownRegion { .. })));
    }
}
