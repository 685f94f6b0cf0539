//! Cast verification.
//!
//! Given the pointer a cast starts from (`src`), the adjusted pointer it
//! produces (`dst`) and the hash of the target type, decide whether the
//! object recorded under `src` has a subobject of that type at `dst`.

use castguard_core::{TypeHash, WalkOutcome};
use thiserror::Error;

use crate::metrics::CastMetrics;
use crate::registry::{AncestorCheck, ClassRegistry};
use crate::shadow::ShadowTable;

/// Why a cast was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptReason {
    NullSource,
    /// No metadata covers the source.
    UntrackedSource,
    /// Allocation type opted out of checking.
    Excluded,
    /// Allocation or element type carries no hash.
    UntrackedType,
    Exact,
    Ancestor,
    /// Checking is switched off for the process.
    CheckingDisabled,
}

/// Why a cast was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("destination lies before the allocation base")]
    NegativeOffset,
    #[error("no subobject starts at the destination offset")]
    UnknownOffset,
    #[error("resolved type was never registered")]
    UnknownHash,
    #[error("resolved type is not the target type or one of its subtypes")]
    TypeMismatch,
}

impl RejectReason {
    /// Stable code returned across the C boundary.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NegativeOffset => 1,
            Self::UnknownOffset => 2,
            Self::UnknownHash => 3,
            Self::TypeMismatch => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NegativeOffset => "negative_offset",
            Self::UnknownOffset => "unknown_offset",
            Self::UnknownHash => "unknown_hash",
            Self::TypeMismatch => "type_mismatch",
        }
    }
}

/// Everything known about a refused cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastViolation {
    pub reason: RejectReason,
    pub src: usize,
    pub dst: usize,
    pub alloc_base: usize,
    pub offset: i64,
    /// Type found at the offset, when resolution got that far.
    pub resolved: Option<TypeHash>,
    pub dst_hash: TypeHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastVerdict {
    Accept(AcceptReason),
    Reject(CastViolation),
}

impl CastVerdict {
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    /// 0 for accept, the reason code otherwise.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Accept(_) => 0,
            Self::Reject(violation) => violation.reason.code(),
        }
    }
}

/// Read-only view over the stores a check consults.
#[derive(Clone, Copy)]
pub struct CastGuard<'a> {
    pub shadow: &'a ShadowTable,
    pub registry: &'a ClassRegistry,
    pub metrics: &'a CastMetrics,
}

impl<'a> CastGuard<'a> {
    #[must_use]
    pub const fn new(
        shadow: &'a ShadowTable,
        registry: &'a ClassRegistry,
        metrics: &'a CastMetrics,
    ) -> Self {
        Self {
            shadow,
            registry,
            metrics,
        }
    }

    /// Decide one cast without side effects beyond counters.
    #[must_use]
    pub fn resolve_cast(&self, src: usize, dst: usize, dst_hash: TypeHash) -> CastVerdict {
        let m = self.metrics;
        CastMetrics::inc(&m.casts_checked);

        if src == 0 {
            CastMetrics::inc(&m.null_sources);
            return CastVerdict::Accept(AcceptReason::NullSource);
        }
        let slot = self.shadow.slot(src).map(|s| s.load());
        let Some((base, descriptor)) = slot.and_then(|v| Some((v.base, v.descriptor?))) else {
            CastMetrics::inc(&m.untracked_sources);
            return CastVerdict::Accept(AcceptReason::UntrackedSource);
        };
        if base == 0 {
            CastMetrics::inc(&m.untracked_sources);
            return CastVerdict::Accept(AcceptReason::UntrackedSource);
        }
        CastMetrics::inc(&m.tracked_sources);

        let offset = (dst as i64).wrapping_sub(base as i64);
        let reject = |reason: RejectReason, resolved: Option<TypeHash>| {
            CastMetrics::inc(match reason {
                RejectReason::NegativeOffset => &m.rejects_negative_offset,
                RejectReason::UnknownOffset => &m.rejects_unknown_offset,
                RejectReason::UnknownHash => &m.rejects_unknown_hash,
                RejectReason::TypeMismatch => &m.rejects_type_mismatch,
            });
            CastVerdict::Reject(CastViolation {
                reason,
                src,
                dst,
                alloc_base: base,
                offset,
                resolved,
                dst_hash,
            })
        };
        if offset < 0 {
            return reject(RejectReason::NegativeOffset, None);
        }

        let resolved = match descriptor.resolve(offset as u64) {
            WalkOutcome::Resolved(hash) => hash,
            WalkOutcome::Excluded => {
                CastMetrics::inc(&m.excluded_accepts);
                return CastVerdict::Accept(AcceptReason::Excluded);
            }
            WalkOutcome::Untracked => {
                CastMetrics::inc(&m.untyped_accepts);
                return CastVerdict::Accept(AcceptReason::UntrackedType);
            }
            WalkOutcome::UnknownOffset => return reject(RejectReason::UnknownOffset, None),
        };
        if resolved.is_no_info() {
            CastMetrics::inc(&m.untyped_accepts);
            return CastVerdict::Accept(AcceptReason::UntrackedType);
        }
        if resolved == dst_hash {
            CastMetrics::inc(&m.exact_accepts);
            return CastVerdict::Accept(AcceptReason::Exact);
        }
        match self.registry.check(resolved, dst_hash) {
            AncestorCheck::Ancestor => {
                CastMetrics::inc(&m.ancestor_accepts);
                CastVerdict::Accept(AcceptReason::Ancestor)
            }
            AncestorCheck::UnknownHash => reject(RejectReason::UnknownHash, Some(resolved)),
            AncestorCheck::NotAncestor => reject(RejectReason::TypeMismatch, Some(resolved)),
        }
    }
}
