//! Runtime half of the castguard type-confusion detector.
//!
//! Instrumented code records the static type of each tracked allocation
//! and asks, at every checked downcast, whether the target type really
//! lives at the adjusted address.
//!
//! # Architecture
//!
//! - **Shadow store** (`shadow`): sparse page table mapping addresses to
//!   metadata slots of `(allocation base, descriptor)`
//! - **Write path** (`record`): fills the slots of a new allocation
//! - **Class registry** (`registry`): class hash to ancestor hash sets,
//!   merged from per-module registration tables
//! - **Resolution** (`resolve`): descriptor walk over raw slot addresses
//! - **Verification** (`verify`): accept/reject decision for one cast
//! - **Runtime** (`runtime`): the above plus policy and reporting
//! - **Globals** (`globals`): process singleton, loaded ELF segments
//! - **Configuration** (`config`): check mode and report settings
//! - **Reports** (`report`): JSONL diagnostics
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

pub mod config;
#[allow(unsafe_code)]
pub mod globals;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod report;
#[allow(unsafe_code)]
pub mod resolve;
pub mod runtime;
#[allow(unsafe_code)]
pub mod shadow;
pub mod verify;

pub use config::{CheckMode, RuntimeConfig};
pub use metrics::{CastMetrics, MetricsSnapshot};
pub use record::{AllocationKind, AllocationRecord, RecordError, WritePlan};
pub use registry::{AncestorCheck, ClassRegistry, MergeSummary};
pub use report::{DiagnosticRecord, JsonlSink, MemorySink, ReportSink};
pub use resolve::DescriptorRef;
pub use runtime::Runtime;
pub use shadow::{MetadataRegion, ShadowError, ShadowGeometry, ShadowTable};
pub use verify::{AcceptReason, CastGuard, CastVerdict, CastViolation, RejectReason};
