// Entry points take raw pointers from instrumented code; each validates what
// it can and passes through on anything it cannot interpret.
#![allow(clippy::missing_safety_doc)]
//! # castguard-abi
//!
//! `extern "C"` boundary for instrumented programs.
//!
//! The compiler pass emits calls to the `castguard_*` symbols exported here:
//!
//! ```text
//! module init   -> castguard_register_type_hashes -> class registry
//! allocation    -> castguard_record_allocation    -> shadow metadata slots
//! checked cast  -> castguard_verify_cast          -> verdict, report, policy
//! ```
//!
//! All state lives in the process runtime of `castguard-membrane`. When the
//! shadow table cannot be reserved every entry point degrades to a no-op and
//! every cast is accepted.

#[macro_use]
mod macros;

mod runtime_state;
pub mod util;

pub mod alloc_abi;
pub mod init_abi;
pub mod registry_abi;
pub mod verify_abi;
