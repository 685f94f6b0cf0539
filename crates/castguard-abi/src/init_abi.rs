//! Process startup.

use std::ffi::c_int;

use crate::runtime_state::runtime;

abi_fn! {
    /// Initialize the process runtime. Idempotent.
    ///
    /// Returns 0 when the runtime is ready, -1 otherwise.
    fn castguard_init() -> c_int {
        if runtime().is_some() { 0 } else { -1 }
    }
}

#[cfg(all(target_os = "linux", not(test)))]
extern "C" fn startup_hook() {
    // SAFETY: castguard_init takes no arguments and touches no caller memory.
    let _ = unsafe { castguard_init() };
}

// Reserve the shadow table before any instrumented constructor runs.
#[cfg(all(target_os = "linux", not(test)))]
#[used]
#[unsafe(link_section = ".init_array")]
static STARTUP_HOOK: extern "C" fn() = startup_hook;
