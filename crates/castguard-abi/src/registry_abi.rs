//! Class hash registration.

use castguard_core::RegistrationTable;
use castguard_core::registration::scan_len;

abi_fn! {
    /// Merge one module's registration table of `count` entries.
    ///
    /// Malformed tables (zero hash counts) are ignored as a whole.
    fn castguard_register_type_hashes(count: u32, table: *const u64),
    runtime(rt);
    {
        if table.is_null() || count == 0 {
            return;
        }
        let count = count as usize;
        // SAFETY: the instrumentation emits `count` well-formed entries; only
        // header words are read until the full length is known.
        let Ok(len) = scan_len(count, |pos| *table.add(pos)) else {
            return;
        };
        let words = std::slice::from_raw_parts(table, len);
        if let Ok(decoded) = RegistrationTable::decode(count, words) {
            rt.register_types(&decoded);
        }
    }
}
