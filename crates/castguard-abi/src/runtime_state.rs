//! Access to the process runtime from entry points.

use castguard_membrane::Runtime;
use castguard_membrane::globals::{existing_runtime, global_runtime};

/// Runtime for an entry point, initializing it on first use.
///
/// `None` means checks pass through: either the shadow table could not be
/// reserved or initialization is in progress on this or another thread.
#[inline]
pub(crate) fn runtime() -> Option<&'static Runtime> {
    existing_runtime().or_else(global_runtime)
}
