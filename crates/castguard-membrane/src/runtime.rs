//! The checker as one object: shadow store, registry, counters, policy and
//! report sink.
//!
//! The process-wide instance lives in [`crate::globals`]; tests and tools
//! build their own over a small [`ShadowGeometry`].

use castguard_core::{Hierarchy, RegistrationTable, TypeHash};

use crate::config::RuntimeConfig;
use crate::metrics::CastMetrics;
use crate::record::{self, AllocationRecord, RecordError, WritePlan};
use crate::registry::{ClassRegistry, MergeSummary};
use crate::report::{
    DiagnosticRecord, JsonlSink, MissingReportThrottle, ReportSink, capture_backtrace,
};
use crate::shadow::{MetadataRegion, ShadowError, ShadowGeometry, ShadowTable};
use crate::verify::{AcceptReason, CastGuard, CastVerdict, CastViolation};

/// Exit status after a fatal report.
pub const FATAL_EXIT_STATUS: i32 = 255;

pub struct Runtime {
    shadow: ShadowTable,
    registry: ClassRegistry,
    metrics: CastMetrics,
    config: RuntimeConfig,
    sink: Box<dyn ReportSink>,
    missing: MissingReportThrottle,
}

impl Runtime {
    #[must_use]
    pub fn new(shadow: ShadowTable, config: RuntimeConfig, sink: Box<dyn ReportSink>) -> Self {
        Self {
            shadow,
            registry: ClassRegistry::new(),
            metrics: CastMetrics::new(),
            config,
            sink,
            missing: MissingReportThrottle::new(),
        }
    }

    /// Reserve a shadow table and report to the configured log (or stderr).
    pub fn reserve(
        geometry: ShadowGeometry,
        hint: Option<usize>,
        config: RuntimeConfig,
    ) -> Result<Self, ShadowError> {
        let shadow = ShadowTable::reserve_at(geometry, hint)?;
        let sink = JsonlSink::from_path(config.log_path.as_deref());
        Ok(Self::new(shadow, config, Box::new(sink)))
    }

    #[must_use]
    pub const fn shadow(&self) -> &ShadowTable {
        &self.shadow
    }

    #[must_use]
    pub const fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn metrics(&self) -> &CastMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub const fn guard(&self) -> CastGuard<'_> {
        CastGuard::new(&self.shadow, &self.registry, &self.metrics)
    }

    /// Merge one module's registration table.
    pub fn register_types(&self, table: &RegistrationTable) -> MergeSummary {
        self.registry.merge_table(table, &self.metrics)
    }

    /// Merge an analyzed hierarchy and remember its class names.
    pub fn register_hierarchy(&self, hierarchy: &Hierarchy) -> MergeSummary {
        for class in hierarchy.classes() {
            self.registry.register_name(class.hash, class.name.clone());
        }
        self.registry
            .merge_entries(&hierarchy.registration_entries(), &self.metrics)
    }

    pub fn record_allocation(&self, record: &AllocationRecord) -> Result<WritePlan, RecordError> {
        record::record_allocation(&self.shadow, &self.metrics, record)
    }

    /// Allocate and bind metadata for an address range.
    pub fn track_range(
        &self,
        base: usize,
        size: usize,
        alignment_bits: u8,
    ) -> Result<MetadataRegion, ShadowError> {
        let region = self.shadow.track_range(base, size, alignment_bits)?;
        CastMetrics::inc(&self.metrics.ranges_tracked);
        Ok(region)
    }

    /// Decide a cast without reporting or terminating.
    #[must_use]
    pub fn resolve_cast(&self, src: usize, dst: usize, dst_hash: TypeHash) -> CastVerdict {
        self.guard().resolve_cast(src, dst, dst_hash)
    }

    /// Decide a cast and apply the configured policy: report rejects, and
    /// in fatal mode exit the process.
    pub fn verify_cast(&self, src: usize, dst: usize, dst_hash: TypeHash) -> CastVerdict {
        let verdict = self.check_and_report(src, dst, dst_hash);
        if self.should_terminate(&verdict) {
            std::process::exit(FATAL_EXIT_STATUS);
        }
        verdict
    }

    /// [`Self::verify_cast`] without the exit.
    pub fn check_and_report(&self, src: usize, dst: usize, dst_hash: TypeHash) -> CastVerdict {
        if !self.config.mode.checking_enabled() {
            return CastVerdict::Accept(AcceptReason::CheckingDisabled);
        }
        let verdict = self.resolve_cast(src, dst, dst_hash);
        match &verdict {
            CastVerdict::Reject(violation) => self.report_violation(violation),
            CastVerdict::Accept(AcceptReason::UntrackedSource) if self.config.report_missing => {
                if let Some(count) = self.missing.hit() {
                    self.emit(&DiagnosticRecord::missing_metadata(src, dst, count));
                }
            }
            CastVerdict::Accept(_) => {}
        }
        verdict
    }

    #[must_use]
    pub fn should_terminate(&self, verdict: &CastVerdict) -> bool {
        self.config.mode.terminates() && !verdict.is_accept()
    }

    /// Emit the diagnostic line for a refused cast.
    pub fn report_violation(&self, violation: &CastViolation) {
        let record = DiagnosticRecord::bad_cast(violation, self.config.mode)
            .with_type_names(
                violation.resolved.and_then(|h| self.registry.name_of(h)),
                self.registry.name_of(violation.dst_hash),
            )
            .with_backtrace(capture_backtrace());
        self.emit(&record);
    }

    fn emit(&self, record: &DiagnosticRecord) {
        // A failing sink must not turn a report into a second fault.
        if self.sink.emit(record).is_ok() {
            CastMetrics::inc(&self.metrics.reports_emitted);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("shadow", &self.shadow)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
