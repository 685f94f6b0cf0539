//! Process-wide runtime instance and global-data tracking.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::config::runtime_config;
use crate::metrics::CastMetrics;
use crate::runtime::Runtime;
use crate::shadow::{DEFAULT_TABLE_HINT, ShadowGeometry, ShadowTable};

// Lifecycle states.
const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

// Hand-rolled state machine instead of OnceLock: a reentrant call during
// init (the reservation itself may be intercepted) must not block.
static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

fn ready() -> Option<&'static Runtime> {
    let ptr = RUNTIME_PTR.load(Ordering::Acquire);
    // SAFETY: once READY, RUNTIME_PTR holds a leaked Box that is never
    // freed or replaced.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// The process runtime, created on first call.
///
/// Returns `None` while another thread is initializing, or for good if the
/// shadow table could not be reserved.
pub fn global_runtime() -> Option<&'static Runtime> {
    match RUNTIME_STATE.load(Ordering::Acquire) {
        STATE_READY => return ready(),
        STATE_INITIALIZING | STATE_FAILED => return None,
        _ => {}
    }

    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if RUNTIME_STATE.load(Ordering::Acquire) == STATE_READY {
            ready()
        } else {
            None
        };
    }

    let runtime = match Runtime::reserve(
        ShadowGeometry::DEFAULT,
        Some(DEFAULT_TABLE_HINT),
        runtime_config().clone(),
    ) {
        Ok(runtime) => runtime,
        Err(_) => {
            RUNTIME_STATE.store(STATE_FAILED, Ordering::Release);
            return None;
        }
    };
    let ptr = Box::into_raw(Box::new(runtime));
    RUNTIME_PTR.store(ptr, Ordering::Release);
    RUNTIME_STATE.store(STATE_READY, Ordering::Release);
    ready()
}

/// The process runtime if it already exists; never initializes.
#[must_use]
pub fn existing_runtime() -> Option<&'static Runtime> {
    if RUNTIME_STATE.load(Ordering::Acquire) == STATE_READY {
        ready()
    } else {
        None
    }
}

/// Outcome of [`track_loaded_segments`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentSummary {
    pub tracked: usize,
    /// Segments whose first page already had metadata.
    pub already_tracked: usize,
    /// Segments outside the shadow space or whose metadata could not be
    /// mapped.
    pub failed: usize,
}

/// Granule used for loaded segments.
pub const SEGMENT_ALIGNMENT_BITS: u8 = 3;

struct SegmentWalk<'a> {
    shadow: &'a ShadowTable,
    metrics: &'a CastMetrics,
    summary: SegmentSummary,
}

impl SegmentWalk<'_> {
    fn visit(&mut self, start: usize, size: usize) {
        if size == 0 {
            return;
        }
        if self.shadow.is_tracked(start) {
            self.summary.already_tracked += 1;
            return;
        }
        match self.shadow.track_range(start, size, SEGMENT_ALIGNMENT_BITS) {
            Ok(_) => {
                self.summary.tracked += 1;
                CastMetrics::inc(&self.metrics.ranges_tracked);
            }
            Err(_) => self.summary.failed += 1,
        }
    }
}

unsafe extern "C" fn visit_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    // SAFETY: `data` is the `SegmentWalk` passed to dl_iterate_phdr below,
    // and `info` is valid for the duration of the callback.
    let (walk, info) = unsafe { (&mut *data.cast::<SegmentWalk<'_>>(), &*info) };
    if info.dlpi_phdr.is_null() {
        return 0;
    }
    // SAFETY: the loader provides `dlpi_phnum` program headers.
    let headers = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
    for header in headers {
        if header.p_type != libc::PT_LOAD {
            continue;
        }
        let start = (info.dlpi_addr as usize).wrapping_add(header.p_vaddr as usize);
        walk.visit(start, header.p_memsz as usize);
    }
    0
}

/// Track every `PT_LOAD` segment of every loaded object.
pub fn track_loaded_segments(shadow: &ShadowTable, metrics: &CastMetrics) -> SegmentSummary {
    let mut walk = SegmentWalk {
        shadow,
        metrics,
        summary: SegmentSummary::default(),
    };
    // SAFETY: the callback only touches `walk`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(visit_object), (&raw mut walk).cast::<c_void>());
    }
    walk.summary
}
